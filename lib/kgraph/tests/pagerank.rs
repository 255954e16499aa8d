//! PageRank over a local two-worker job, the classic smoke test for the
//! whole engine: messages, aggregator-free compute, iteration bound.

use kgraph::config::{GROUP_SIZE, MAX_ITERATIONS, NUM_PARTITIONS};
use kgraph::{run_local, ComputeCallback, Edge, FsCoordinationStore, PregelConfig, VertexProgram, VertexView};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

struct PageRank {
    damping: f64,
    vertex_count: f64,
}

impl VertexProgram for PageRank {
    type Id = u64;
    type Value = f64;
    type EdgeValue = ();
    type Message = f64;

    fn compute(
        &self,
        superstep: i32,
        vertex: &VertexView<'_, Self>,
        messages: &[f64],
        cb: &mut ComputeCallback<'_, Self>,
    ) -> anyhow::Result<()> {
        let rank = if superstep == 0 {
            *vertex.value
        } else {
            let incoming: f64 = messages.iter().sum();
            let rank = (1.0 - self.damping) / self.vertex_count + self.damping * incoming;
            cb.set_new_vertex_value(rank);
            rank
        };
        if !vertex.edges.is_empty() {
            let share = rank / vertex.edges.len() as f64;
            for edge in vertex.edges {
                cb.send_message_to(&edge.target, share)?;
            }
        }
        Ok(())
    }
}

fn cycle(ids: &[u64]) -> Vec<(u64, f64, Vec<Edge<u64, ()>>)> {
    let initial = 1.0 / ids.len() as f64;
    ids.iter()
        .enumerate()
        .map(|(i, &id)| {
            let next = ids[(i + 1) % ids.len()];
            (id, initial, vec![Edge { target: next, value: () }])
        })
        .collect()
}

fn run_cycle(name: &str, ids: &[u64]) -> Vec<f64> {
    let dir: PathBuf =
        std::env::temp_dir().join(format!("kgraph-pagerank-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    let store = Arc::new(FsCoordinationStore::open(&dir).expect("open store"));
    let config = PregelConfig::new()
        .set(GROUP_SIZE, 2)
        .set(NUM_PARTITIONS, 2)
        .set(MAX_ITERATIONS, 4);
    let program = PageRank { damping: 0.85, vertex_count: ids.len() as f64 };
    let result = run_local(name, program, config, store, cycle(ids)).expect("clean run");
    assert_eq!(result.last_superstep, 3, "max.iterations=4 runs supersteps 0..=3");

    let mut ranks: Vec<f64> = ids.iter().map(|id| result.vertices[id]).collect();
    ranks.sort_by(|a, b| a.partial_cmp(b).expect("finite ranks"));
    let _ = fs::remove_dir_all(dir);
    ranks
}

#[test]
fn four_cycle_stays_uniform() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let ranks = run_cycle("uniform", &[1, 2, 3, 4]);
    for rank in &ranks {
        assert!((rank - 0.25).abs() < 1e-6, "rank drifted: {}", rank);
    }
    let total: f64 = ranks.iter().sum();
    assert!((total - 1.0).abs() < 1e-6);
}

#[test]
fn isomorphic_rotations_agree() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let base = run_cycle("base", &[1, 2, 3, 4]);
    let rotated = run_cycle("rotated", &[12, 13, 14, 11]);
    for (a, b) in base.iter().zip(rotated.iter()) {
        assert!((a - b).abs() < 1e-6, "isomorphic graphs diverged: {} vs {}", a, b);
    }
}

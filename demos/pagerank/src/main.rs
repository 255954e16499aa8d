use anyhow::{Context, Result};
use clap::Parser;
use kgraph::config::{COORDINATION_CONNECT, GROUP_SIZE, MAX_ITERATIONS, NUM_PARTITIONS};
use kgraph::{run_local, ComputeCallback, Edge, FsCoordinationStore, PregelConfig, VertexProgram, VertexView};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Edge list file, one "src dst" pair per line
    #[arg(long)]
    input: String,
    /// Output file for "vertex rank" lines
    #[arg(long)]
    output: String,
    /// Number of workers
    #[arg(long, default_value_t = 2)]
    workers: usize,
    /// Supersteps to run
    #[arg(long, default_value_t = 20)]
    iterations: i32,
    /// Damping factor
    #[arg(long, default_value_t = 0.85)]
    damping: f64,
    /// Directory for the coordination tree; a fresh temp dir when unset
    #[arg(long)]
    coordination_dir: Option<String>,
}

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
    ) -> Result<()> {
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

fn load_graph(path: &str) -> Result<Vec<(u64, f64, Vec<Edge<u64, ()>>)>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("open {}", path))?);
    let mut adjacency: HashMap<u64, Vec<Edge<u64, ()>>> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(src), Some(dst)) = (parts.next(), parts.next()) else { continue };
        let src: u64 = src.parse().with_context(|| format!("bad vertex id '{}'", src))?;
        let dst: u64 = dst.parse().with_context(|| format!("bad vertex id '{}'", dst))?;
        adjacency.entry(src).or_default().push(Edge { target: dst, value: () });
        adjacency.entry(dst).or_default();
    }
    let initial = 1.0 / adjacency.len().max(1) as f64;
    Ok(adjacency.into_iter().map(|(id, edges)| (id, initial, edges)).collect())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let graph = load_graph(&args.input)?;
    let vertex_count = graph.len() as f64;
    info!(vertices = graph.len(), workers = args.workers, "loaded graph");

    let coordination_dir = args.coordination_dir.clone().unwrap_or_else(|| {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_secs();
        std::env::temp_dir()
            .join(format!("kgraph-pagerank-{}-{}", std::process::id(), ts))
            .to_string_lossy()
            .into_owned()
    });

    let job_id = format!("pagerank-{}", std::process::id());
    let config = PregelConfig::new()
        .set(GROUP_SIZE, args.workers)
        .set(NUM_PARTITIONS, args.workers)
        .set(MAX_ITERATIONS, args.iterations)
        .set(COORDINATION_CONNECT, &coordination_dir);
    let store = Arc::new(FsCoordinationStore::from_config(&config)?);
    let program = PageRank { damping: args.damping, vertex_count };
    let result = run_local(&job_id, program, config, store, graph)?;
    info!(last_superstep = result.last_superstep, "computation finished");

    let mut ranked: Vec<(u64, f64)> = result.vertices.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut writer = BufWriter::new(File::create(&args.output).with_context(|| format!("create {}", args.output))?);
    for (vertex, rank) in ranked {
        writeln!(writer, "{}\t{:.8}", vertex, rank)?;
    }
    writer.flush()?;
    Ok(())
}

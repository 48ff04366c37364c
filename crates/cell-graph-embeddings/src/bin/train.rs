//! Training binary for the shared relational embedding model.
//!
//! Loads a dataset (JSON) or builds a small synthetic one, trains for the
//! configured number of epochs, and writes embeddings, history and
//! metrics to the output directory.
//!
//! # Usage
//!
//! ```bash
//! train --data dataset.json --epochs 100 --output runs/liver
//! train --config train.toml --loader neighbor --num-neighbors 10
//! train --resume runs/liver/best_model.safetensors --epochs 50
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use candle_core::Device;
use serde::Deserialize;

use cell_graph_embeddings::config::{LoaderKind, TrainConfig};
use cell_graph_embeddings::data::{
    ContextGraph, ContextId, DatasetRegistry, EdgeList, RelationId,
};
use cell_graph_embeddings::metrics::TracingSink;
use cell_graph_embeddings::train::TrainingSession;

/// CLI arguments.
struct Args {
    /// Optional TOML config file; CLI flags override it.
    config_path: Option<PathBuf>,
    /// Optional JSON dataset; a synthetic demo dataset is used otherwise.
    data_path: Option<PathBuf>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    loader: Option<String>,
    num_neighbors: usize,
    seed: Option<u64>,
    output: Option<PathBuf>,
    /// Saved model snapshot to restore before the first epoch.
    resume: Option<PathBuf>,
    no_center_loss: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config_path: None,
            data_path: None,
            epochs: None,
            batch_size: None,
            loader: None,
            num_neighbors: 10,
            seed: None,
            output: None,
            resume: None,
            no_center_loss: false,
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    result.config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--data" | "-d" => {
                i += 1;
                if i < args.len() {
                    result.data_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--epochs" | "-e" => {
                i += 1;
                if i < args.len() {
                    result.epochs = args[i].parse().ok();
                }
            }
            "--batch-size" | "-b" => {
                i += 1;
                if i < args.len() {
                    result.batch_size = args[i].parse().ok();
                }
            }
            "--loader" => {
                i += 1;
                if i < args.len() {
                    result.loader = Some(args[i].clone());
                }
            }
            "--num-neighbors" => {
                i += 1;
                if i < args.len() {
                    result.num_neighbors = args[i].parse().unwrap_or(10);
                }
            }
            "--seed" => {
                i += 1;
                if i < args.len() {
                    result.seed = args[i].parse().ok();
                }
            }
            "--output" | "-o" => {
                i += 1;
                if i < args.len() {
                    result.output = Some(PathBuf::from(&args[i]));
                }
            }
            "--resume" | "-r" => {
                i += 1;
                if i < args.len() {
                    result.resume = Some(PathBuf::from(&args[i]));
                }
            }
            "--no-center-loss" => {
                result.no_center_loss = true;
            }
            "--help" | "-h" => {
                println!("train: shared relational embedding training");
                println!();
                println!("Usage: train [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>      TOML config file");
                println!("  -d, --data <PATH>        JSON dataset (default: synthetic demo)");
                println!("  -e, --epochs <N>         Training epochs");
                println!("  -b, --batch-size <N>     Seed-node batch size");
                println!("      --loader <KIND>      full | neighbor");
                println!("      --num-neighbors <N>  Neighbors per seed node (default: 10)");
                println!("      --seed <N>           Run seed");
                println!("  -o, --output <PATH>      Output directory");
                println!("  -r, --resume <PATH>      Saved model snapshot to continue from");
                println!("      --no-center-loss     Disable the auxiliary center loss");
                println!("  -h, --help               Show this help");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    result
}

/// JSON dataset schema. Map keys are relation ids as strings.
#[derive(Deserialize)]
struct DatasetFile {
    relations: BTreeMap<String, String>,
    meta_relations: BTreeMap<String, String>,
    contexts: Vec<ContextFile>,
    meta: GraphFile,
}

#[derive(Deserialize)]
struct ContextFile {
    id: u32,
    name: String,
    meta_node: u32,
    #[serde(default)]
    cluster_labels: Option<Vec<u32>>,
    #[serde(flatten)]
    graph: GraphFile,
}

#[derive(Deserialize)]
struct GraphFile {
    num_nodes: usize,
    feature_dim: usize,
    features: Vec<f32>,
    edges: BTreeMap<String, Vec<(u32, u32)>>,
}

fn relation_table(raw: &BTreeMap<String, String>) -> BTreeMap<RelationId, String> {
    raw.iter()
        .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (RelationId(id), v.clone())))
        .collect()
}

fn build_graph(file: &GraphFile) -> ContextGraph {
    let mut edges = BTreeMap::new();
    for (key, pairs) in &file.edges {
        if let Ok(id) = key.parse::<u32>() {
            edges.insert(RelationId(id), EdgeList::from_pairs(pairs));
        }
    }
    ContextGraph::new(file.features.clone(), file.num_nodes, file.feature_dim, edges)
        .expect("invalid graph in dataset file")
}

fn load_dataset(path: &std::path::Path) -> DatasetRegistry {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    let file: DatasetFile = serde_json::from_str(&raw)
        .unwrap_or_else(|e| panic!("failed to parse {}: {}", path.display(), e));

    let mut contexts = BTreeMap::new();
    let mut names = BTreeMap::new();
    let mut meta_index = BTreeMap::new();
    let mut labels = BTreeMap::new();
    for ctx in &file.contexts {
        let id = ContextId(ctx.id);
        contexts.insert(id, build_graph(&ctx.graph));
        names.insert(id, ctx.name.clone());
        meta_index.insert(id, ctx.meta_node);
        if let Some(l) = &ctx.cluster_labels {
            labels.insert(id, l.clone());
        }
    }
    DatasetRegistry::new(
        contexts,
        names,
        build_graph(&file.meta),
        meta_index,
        relation_table(&file.relations),
        relation_table(&file.meta_relations),
        labels,
    )
    .expect("inconsistent dataset file")
}

/// Small synthetic dataset: ring graphs with chord edges, so training has
/// real structure to fit without any input files.
fn demo_registry() -> DatasetRegistry {
    let rel = RelationId(0);
    let num_contexts = 4u32;
    let nodes = 24usize;
    let feature_dim = 8usize;

    let mut contexts = BTreeMap::new();
    let mut names = BTreeMap::new();
    let mut meta_index = BTreeMap::new();
    let mut labels = BTreeMap::new();
    for i in 0..num_contexts {
        let mut pairs = Vec::new();
        for n in 0..nodes as u32 {
            pairs.push((n, (n + 1) % nodes as u32));
            pairs.push((n, (n + 3 + i) % nodes as u32));
        }
        let mut edges = BTreeMap::new();
        edges.insert(rel, EdgeList::from_pairs(&pairs));
        let features: Vec<f32> = (0..nodes * feature_dim)
            .map(|v| ((v as f32 + i as f32) * 0.37).sin())
            .collect();
        let id = ContextId(i);
        contexts.insert(
            id,
            ContextGraph::new(features, nodes, feature_dim, edges).expect("demo graph"),
        );
        names.insert(id, format!("demo-context-{}", i));
        meta_index.insert(id, i);
        labels.insert(id, (0..nodes).map(|n| (n % 3) as u32).collect());
    }

    let meta_nodes = num_contexts as usize;
    let mut meta_pairs = Vec::new();
    for n in 0..num_contexts {
        meta_pairs.push((n, (n + 1) % num_contexts));
    }
    let mut meta_edges = BTreeMap::new();
    meta_edges.insert(rel, EdgeList::from_pairs(&meta_pairs));
    let meta_features: Vec<f32> = (0..meta_nodes * 4).map(|v| (v as f32 * 0.61).cos()).collect();
    let meta = ContextGraph::new(meta_features, meta_nodes, 4, meta_edges).expect("demo meta graph");

    let mut relations = BTreeMap::new();
    relations.insert(rel, "interacts".to_string());
    let mut meta_relations = BTreeMap::new();
    meta_relations.insert(rel, "adjacent".to_string());
    DatasetRegistry::new(contexts, names, meta, meta_index, relations, meta_relations, labels)
        .expect("demo registry")
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = parse_args();

    let mut config = match &args.config_path {
        Some(path) => TrainConfig::from_file(path).expect("failed to load config"),
        None => TrainConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    match args.loader.as_deref() {
        Some("full") => config.loader = LoaderKind::FullGraph,
        Some("neighbor") => {
            config.loader = LoaderKind::Neighbor {
                num_neighbors: args.num_neighbors,
            }
        }
        Some(other) => {
            eprintln!("Unknown loader kind: {} (expected full | neighbor)", other);
            std::process::exit(1);
        }
        None => {}
    }
    if args.no_center_loss {
        config.hyperparams.use_center_loss = false;
    }
    config.validate().expect("invalid configuration");

    println!("=== Shared Relational Embedding Training ===");
    println!("Epochs:     {}", config.epochs);
    println!("Batch size: {}", config.batch_size);
    println!("Loader:     {:?}", config.loader);
    println!("Seed:       {}", config.seed);
    println!("Output:     {}", config.output_dir.display());
    println!();

    let device = if candle_core::utils::cuda_is_available() {
        println!("Using CUDA GPU");
        Device::new_cuda(0).expect("Failed to initialize CUDA device")
    } else {
        println!("CUDA not available, using CPU");
        Device::Cpu
    };

    let registry = match &args.data_path {
        Some(path) => {
            println!("Loading dataset from {}", path.display());
            load_dataset(path)
        }
        None => {
            println!("No dataset given, using the synthetic demo dataset");
            demo_registry()
        }
    };
    println!(
        "Dataset: {} contexts, meta graph with {} nodes",
        registry.contexts().len(),
        registry.meta().num_nodes()
    );

    let mut session =
        TrainingSession::new(registry, config, &device).expect("failed to build session");
    if let Some(path) = &args.resume {
        println!("Resuming from {}", path.display());
        session
            .resume_from(path)
            .expect("failed to restore saved model");
    }
    let mut sink = TracingSink;
    session.run(&mut sink).expect("training failed");

    let artifacts = session.finalize(&mut sink).expect("finalization failed");
    println!();
    println!("=== Run Summary ===");
    match artifacts.best_epoch {
        Some(epoch) => println!(
            "Best model: epoch {} (val score {:.4})",
            epoch, artifacts.best_score
        ),
        None => println!("Best model: none recorded, exported live parameters"),
    }
    println!(
        "Test: auc={:.4} ap={:.4} acc={:.4} f1={:.4}",
        artifacts.test.auc, artifacts.test.average_precision, artifacts.test.accuracy,
        artifacts.test.f1
    );
    println!(
        "Clustering: calinski_harabasz={:.4} davies_bouldin={:.4}",
        artifacts.clustering.calinski_harabasz, artifacts.clustering.davies_bouldin
    );
    println!("Embeddings for {} contexts written", artifacts.context_embeddings.len());
}

use std::env;

use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use dotenv::dotenv;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vln_agent::agent::{Agent, AgentConfig, Critic, CriticConfig, EncoderConfig, Feedback, RecurrentEncoder};
use vln_agent::env::{Dataset, GraphEnv};

type TrainBackend = Autodiff<NdArray>;

fn get_env_var_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|val| val.parse::<usize>().ok())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vln_agent=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();

    let dataset_path = env::var("VLN_DATASET")
        .map_err(|_| "VLN_DATASET environment variable is required")?;
    let iters = get_env_var_usize("VLN_ITERS").unwrap_or(100);
    let batch_size = get_env_var_usize("VLN_BATCH_SIZE").unwrap_or(8);
    let vocab_size = get_env_var_usize("VLN_VOCAB_SIZE").unwrap_or(30522);
    let seed = get_env_var_usize("VLN_SEED").unwrap_or(0) as u64;
    let feedback: Feedback = env::var("VLN_FEEDBACK")
        .ok()
        .map(|v| v.parse())
        .transpose()?
        .unwrap_or(Feedback::Sample);
    let results_path = env::var("VLN_RESULTS").ok();
    let checkpoint_path = env::var("VLN_CHECKPOINT").ok();

    let config = match env::var("VLN_CONFIG") {
        Ok(path) => AgentConfig::load(&path)?,
        Err(_) => AgentConfig::default(),
    };

    tracing::info!(
        "Training {} iterations with {} feedback, batch size {}",
        iters,
        feedback,
        batch_size
    );

    let dataset = Dataset::from_json_file(&dataset_path)?;
    let feature_size = dataset.feature_size;
    let env = GraphEnv::new(dataset, batch_size, config.angle_feat_size, seed)?;
    let ndtw = env.ndtw_evaluator();

    let device = Default::default();
    let encoder = RecurrentEncoder::<TrainBackend>::new(
        &device,
        &EncoderConfig {
            vocab_size,
            feature_size,
            angle_feat_size: config.angle_feat_size,
            ..EncoderConfig::default()
        },
    );
    let critic = Critic::<TrainBackend>::new(&device, &CriticConfig::default());
    let mut agent = Agent::new(env, encoder, critic, ndtw, config, device)?;

    let mut epoch = 0;
    if let Some(path) = &checkpoint_path {
        if std::path::Path::new(path).exists() {
            epoch = agent.load(path)? + 1;
        }
    }

    agent.train(iters, feedback)?;
    agent.metrics().log_to_console();

    agent.test(Feedback::Argmax, None)?;
    if let Some(path) = &results_path {
        agent.write_results(path, true)?;
    }

    if let Some(path) = &checkpoint_path {
        agent.save(epoch, path)?;
    }

    Ok(())
}

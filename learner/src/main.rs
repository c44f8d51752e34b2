use std::{env, path::PathBuf};

use anyhow::Context;
use learner::{
    AgentState, Checkpoint, ImpalaBuilder, Learner, RunConfig, synthetic::SyntheticReplay,
};
use log::info;
use machine_learning::{
    arch::{Network, RecurrentPolicy, loss::LossFn},
    optimization::Optimizer,
};

const DEFAULT_STEPS: u64 = 100;

/// Usage: `learner [config.json] [steps] [checkpoint.json]`.
fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);

    let config = match args.next() {
        Some(path) => {
            RunConfig::from_json_file(&path).with_context(|| format!("reading config {path}"))?
        }
        None => RunConfig::default(),
    };
    let steps = match args.next() {
        Some(steps) => steps.parse().context("steps must be a non negative integer")?,
        None => DEFAULT_STEPS,
    };
    let checkpoint = args.next().map(PathBuf::from);

    let net = config.network;
    let network = RecurrentPolicy::new(
        net.obs_size,
        net.state_size,
        net.num_actions,
        net.activation.act_fn(),
    )?;
    let replay = SyntheticReplay::new(
        config.impala.replicas,
        config.impala.n_agents,
        config.replay,
        config.network,
    );

    let builder = ImpalaBuilder::new(config.impala.clone())?;
    if config.impala.use_popart {
        train(builder.make_popart_learner(network, replay)?, steps, checkpoint)
    } else {
        train(builder.make_learner(network, replay)?, steps, checkpoint)
    }
}

fn train<S, N, L, O>(
    mut learner: Learner<S, N, L, O>,
    steps: u64,
    checkpoint: Option<PathBuf>,
) -> anyhow::Result<()>
where
    S: AgentState,
    N: Network,
    L: LossFn<N>,
    O: Optimizer,
{
    if let Some(path) = &checkpoint
        && path.exists()
    {
        let snapshot = Checkpoint::read(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        learner.load_checkpoint(snapshot)?;
        info!("resumed from {} at step {}", path.display(), learner.counter().steps());
    }

    for _ in 0..steps {
        learner.step()?;
    }

    if let Some(path) = &checkpoint {
        learner.checkpoint()?.write(path)?;
        info!("saved checkpoint to {}", path.display());
    }

    info!("trained for {steps} steps");
    Ok(())
}

use machine_learning::{
    arch::{Network, loss::ImpalaLoss},
    normalization::{PopArt, PopArtConfig, PopArtMode},
    optimization::{Chain, ClipByGlobalNorm, RmsProp},
};

use crate::{
    config::ImpalaConfig,
    data::ReplaySample,
    error::Result,
    learner::{LearnerOptions, MaLearner, MaLearnerPopArt},
};

/// Builds IMPALA `Learner`s given a config.
#[derive(Debug, Clone)]
pub struct ImpalaBuilder {
    config: ImpalaConfig,
}

impl ImpalaBuilder {
    /// Creates a new `ImpalaBuilder`.
    ///
    /// # Returns
    /// An error if the config is invalid.
    pub fn new(config: ImpalaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ImpalaConfig {
        &self.config
    }

    /// Clips the gradients by their global norm, then applies RMSProp.
    ///
    /// A zero momentum disables the momentum trace altogether.
    pub fn make_optimizer(&self) -> Result<Chain> {
        let c = &self.config;
        let momentum = (c.rmsprop_momentum != 0.).then_some(c.rmsprop_momentum);

        Ok(Chain::new(vec![
            Box::new(ClipByGlobalNorm::new(c.max_gradient_norm)?),
            Box::new(RmsProp::new(
                c.learning_rate,
                c.rmsprop_decay,
                c.rmsprop_eps,
                c.rmsprop_init,
                momentum,
            )?),
        ]))
    }

    pub fn make_loss(&self) -> ImpalaLoss {
        let c = &self.config;
        ImpalaLoss::new(c.discount, c.entropy_cost, c.baseline_cost, c.max_abs_reward)
    }

    /// Selects the full normalizer or the statistics only one, depending on `only_art`.
    pub fn make_normalizer(&self) -> Result<PopArt> {
        let c = &self.config;
        let config = PopArtConfig {
            step_size: c.step_size,
            scale_lb: c.scale_lb,
            scale_ub: c.scale_ub,
        };
        let mode = if c.only_art {
            PopArtMode::ArtOnly
        } else {
            PopArtMode::Full
        };

        Ok(PopArt::new(config, mode)?)
    }

    fn options(&self) -> LearnerOptions {
        LearnerOptions {
            n_agents: self.config.n_agents,
            replicas: self.config.replicas,
            seed: self.config.seed,
            shuffle_interval: self.config.agent_shuffle_interval,
        }
    }

    /// Builds a learner training on raw value targets.
    ///
    /// # Arguments
    /// * `network` - The network every agent trains.
    /// * `iterator` - The source of batches.
    pub fn make_learner<N, I>(
        &self,
        network: N,
        iterator: I,
    ) -> Result<MaLearner<N, ImpalaLoss, Chain>>
    where
        N: Network,
        I: IntoIterator<Item = ReplaySample>,
        I::IntoIter: Send + 'static,
    {
        MaLearner::new(
            network,
            self.make_loss(),
            self.make_optimizer()?,
            None,
            iterator,
            self.options(),
        )
    }

    /// Builds a learner training on normalized value targets.
    ///
    /// # Arguments
    /// * `network` - The network every agent trains.
    /// * `iterator` - The source of batches.
    pub fn make_popart_learner<N, I>(
        &self,
        network: N,
        iterator: I,
    ) -> Result<MaLearnerPopArt<N, ImpalaLoss, Chain>>
    where
        N: Network,
        I: IntoIterator<Item = ReplaySample>,
        I::IntoIter: Send + 'static,
    {
        MaLearnerPopArt::new(
            network,
            self.make_loss(),
            self.make_optimizer()?,
            Some(self.make_normalizer()?),
            iterator,
            self.options(),
        )
    }
}

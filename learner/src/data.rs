use std::collections::BTreeMap;

use machine_learning::arch::loss::Trajectory;
use ndarray::{ArrayD, ArrayViewD, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};

use crate::{
    combined::check_permutation,
    error::{LearnerErr, Result},
};

/// The extra holding the logits of the acting policy, one per action.
pub const LOGITS: &str = "logits";
/// The extra holding the recurrent state of the acting policy, only the first step is used.
pub const CORE_STATE: &str = "core_state";

/// The named leading axes of every field of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisName {
    Replica,
    Agent,
    Time,
    Batch,
}

/// The order of the leading axes of a batch.
///
/// Deserializing goes through `AxisLayout::new`, so every layout names each axis exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[AxisName; 4]", into = "[AxisName; 4]")]
pub struct AxisLayout {
    axes: [AxisName; 4],
    /// Indexed by `AxisName`, in its declaration order.
    positions: [usize; 4],
}

impl AxisLayout {
    /// Creates a new `AxisLayout`.
    ///
    /// # Returns
    /// An error if any of the axes is missing or repeated.
    pub fn new(axes: [AxisName; 4]) -> Result<Self> {
        let mut positions = [None; 4];
        for (pos, axis) in axes.into_iter().enumerate() {
            let slot = &mut positions[axis as usize];
            if slot.is_none() {
                *slot = Some(pos);
            }
        }

        match positions {
            [Some(replica), Some(agent), Some(time), Some(batch)] => Ok(Self {
                axes,
                positions: [replica, agent, time, batch],
            }),
            _ => Err(LearnerErr::InvalidConfig(format!(
                "{axes:?} doesn't name every axis exactly once"
            ))),
        }
    }

    /// Returns the position of an axis.
    pub fn position(&self, axis: AxisName) -> usize {
        self.positions[axis as usize]
    }

    pub fn axes(&self) -> [AxisName; 4] {
        self.axes
    }

    /// The permutation into `[replica, agent, time, batch]`.
    fn to_canonical(self) -> [usize; 4] {
        self.positions
    }
}

impl TryFrom<[AxisName; 4]> for AxisLayout {
    type Error = LearnerErr;

    fn try_from(axes: [AxisName; 4]) -> Result<Self> {
        Self::new(axes)
    }
}

impl From<AxisLayout> for [AxisName; 4] {
    fn from(layout: AxisLayout) -> Self {
        layout.axes
    }
}

impl Default for AxisLayout {
    /// Replicas first, then the sampled batch, the unroll and the agents.
    fn default() -> Self {
        Self {
            axes: [
                AxisName::Replica,
                AxisName::Batch,
                AxisName::Time,
                AxisName::Agent,
            ],
            positions: [0, 3, 2, 1],
        }
    }
}

/// The sizes of the leading axes of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDims {
    pub replicas: usize,
    pub agents: usize,
    pub time: usize,
    pub batch: usize,
}

/// A batch of trajectories as sampled from the replay.
///
/// Every field starts with the four axes of `layout`, observations and extras carry one more
/// trailing feature axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub layout: AxisLayout,
    pub observation: ArrayD<f32>,
    pub action: ArrayD<usize>,
    pub reward: ArrayD<f32>,
    pub discount: ArrayD<f32>,
    pub extras: BTreeMap<String, ArrayD<f32>>,
}

/// A sample pulled from the replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySample {
    pub key: u64,
    pub data: TrainingData,
}

fn check_leading(
    what: &'static str,
    shape: &[usize],
    leading: &[usize],
    trailing: usize,
) -> Result<()> {
    if shape.len() == leading.len() + trailing && shape[..leading.len()] == *leading {
        Ok(())
    } else {
        Err(LearnerErr::LayoutMismatch {
            what,
            got: shape.to_vec(),
            expected: leading.to_vec(),
        })
    }
}

impl TrainingData {
    fn extra(&self, name: &'static str) -> Result<&ArrayD<f32>> {
        self.extras.get(name).ok_or(LearnerErr::MissingExtra(name))
    }

    /// Checks that every field agrees on the leading axes.
    ///
    /// # Returns
    /// The sizes of the leading axes or an error naming the first offending field. Unrolls must
    /// be at least two steps long.
    pub fn dims(&self) -> Result<BatchDims> {
        let leading = self.action.shape();
        if leading.len() != 4 {
            return Err(LearnerErr::LayoutMismatch {
                what: "action rank",
                got: vec![leading.len()],
                expected: vec![4],
            });
        }

        check_leading("observation", self.observation.shape(), leading, 1)?;
        check_leading("reward", self.reward.shape(), leading, 0)?;
        check_leading("discount", self.discount.shape(), leading, 0)?;
        check_leading(LOGITS, self.extra(LOGITS)?.shape(), leading, 1)?;
        check_leading(CORE_STATE, self.extra(CORE_STATE)?.shape(), leading, 1)?;

        let size = |axis| leading[self.layout.position(axis)];
        let dims = BatchDims {
            replicas: size(AxisName::Replica),
            agents: size(AxisName::Agent),
            time: size(AxisName::Time),
            batch: size(AxisName::Batch),
        };

        if dims.time < 2 {
            return Err(LearnerErr::LayoutMismatch {
                what: "unroll length",
                got: vec![dims.time],
                expected: vec![2],
            });
        }

        Ok(dims)
    }

    /// Reorders the agents of the batch, agent `i` of the result is agent `order[i]` of this batch.
    ///
    /// # Returns
    /// The permuted batch or an error if `order` isn't a permutation of the agents.
    pub fn permute_agents(&self, order: &[usize]) -> Result<Self> {
        let dims = self.dims()?;
        check_permutation(order, dims.agents)?;

        let axis = Axis(self.layout.position(AxisName::Agent));
        Ok(Self {
            layout: self.layout,
            observation: self.observation.select(axis, order),
            action: self.action.select(axis, order),
            reward: self.reward.select(axis, order),
            discount: self.discount.select(axis, order),
            extras: self
                .extras
                .iter()
                .map(|(name, extra)| (name.clone(), extra.select(axis, order)))
                .collect(),
        })
    }

    /// Validates the batch and moves its axes into the order the update step works with.
    pub fn canonical(&self) -> Result<Batch> {
        let dims = self.dims()?;
        let perm = self.layout.to_canonical();
        let with_features = [perm[0], perm[1], perm[2], perm[3], 4];

        fn reorder<A: Clone>(array: &ArrayD<A>, axes: &[usize]) -> ArrayD<A> {
            array
                .view()
                .permuted_axes(axes)
                .as_standard_layout()
                .into_owned()
        }

        Ok(Batch {
            dims,
            observation: reorder(&self.observation, &with_features),
            action: reorder(&self.action, &perm),
            reward: reorder(&self.reward, &perm),
            discount: reorder(&self.discount, &perm),
            logits: reorder(self.extra(LOGITS)?, &with_features),
            core_state: reorder(self.extra(CORE_STATE)?, &with_features),
        })
    }
}

/// A validated batch laid out as `[replica, agent, time, batch, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    dims: BatchDims,
    observation: ArrayD<f32>,
    action: ArrayD<usize>,
    reward: ArrayD<f32>,
    discount: ArrayD<f32>,
    logits: ArrayD<f32>,
    core_state: ArrayD<f32>,
}

fn pick<A>(array: &ArrayD<A>, replica: usize, agent: usize) -> ArrayViewD<'_, A> {
    array
        .index_axis(Axis(0), replica)
        .index_axis_move(Axis(0), agent)
}

impl Batch {
    pub fn dims(&self) -> BatchDims {
        self.dims
    }

    /// Extracts the trajectory of a single agent on a single replica.
    ///
    /// # Returns
    /// The trajectory or an error if either index is out of range.
    pub fn trajectory(&self, replica: usize, agent: usize) -> Result<Trajectory> {
        let BatchDims {
            replicas, agents, ..
        } = self.dims;

        if replica >= replicas || agent >= agents {
            return Err(LearnerErr::LayoutMismatch {
                what: "trajectory index",
                got: vec![replica, agent],
                expected: vec![replicas, agents],
            });
        }

        let core_state = pick(&self.core_state, replica, agent).index_axis_move(Axis(0), 0);

        Ok(Trajectory {
            observation: pick(&self.observation, replica, agent)
                .into_dimensionality::<Ix3>()?
                .to_owned(),
            action: pick(&self.action, replica, agent)
                .into_dimensionality::<Ix2>()?
                .to_owned(),
            reward: pick(&self.reward, replica, agent)
                .into_dimensionality::<Ix2>()?
                .to_owned(),
            discount: pick(&self.discount, replica, agent)
                .into_dimensionality::<Ix2>()?
                .to_owned(),
            behaviour_logits: pick(&self.logits, replica, agent)
                .into_dimensionality::<Ix3>()?
                .to_owned(),
            core_state: core_state.into_dimensionality::<Ix2>()?.to_owned(),
        })
    }

    /// Extracts the trajectories of every agent of a replica, in agent order.
    pub fn trajectories(&self, replica: usize) -> Result<Vec<Trajectory>> {
        (0..self.dims.agents)
            .map(|agent| self.trajectory(replica, agent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, Dimension, IxDyn};

    use super::*;

    /// A batch whose values encode their own `[replica, batch, time, agent]` index.
    fn data(layout: AxisLayout, shape: [usize; 4]) -> TrainingData {
        let encode = |idx: &[usize]| {
            let mut named = [0; 4];
            for (pos, axis) in layout.axes().into_iter().enumerate() {
                named[AxisLayout::default().position(axis)] = idx[pos];
            }
            (named[0] * 1000 + named[1] * 100 + named[2] * 10 + named[3]) as f32
        };

        let with = |extra: usize| {
            let mut full = shape.to_vec();
            full.push(extra);
            ArrayD::from_shape_fn(IxDyn(&full), |idx| encode(idx.slice()))
        };

        TrainingData {
            layout,
            observation: with(2),
            action: ArrayD::zeros(IxDyn(&shape)),
            reward: ArrayD::from_shape_fn(IxDyn(&shape), |idx| encode(idx.slice())),
            discount: ArrayD::ones(IxDyn(&shape)),
            extras: BTreeMap::from([
                (LOGITS.to_string(), with(3)),
                (CORE_STATE.to_string(), with(4)),
            ]),
        }
    }

    #[test]
    fn layouts_must_name_every_axis() {
        assert!(AxisLayout::new([AxisName::Agent; 4]).is_err());
        assert!(
            AxisLayout::new([
                AxisName::Time,
                AxisName::Agent,
                AxisName::Batch,
                AxisName::Replica
            ])
            .is_ok()
        );
    }

    #[test]
    fn deserialized_layouts_are_checked() {
        let batch = data(AxisLayout::default(), [1, 2, 2, 3]);
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains(r#""layout":["Replica","Batch","Time","Agent"]"#));

        let restored: TrainingData = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, batch);
        assert_eq!(restored.layout.position(AxisName::Agent), 3);

        let repeated = json.replace(
            r#""layout":["Replica","Batch","Time","Agent"]"#,
            r#""layout":["Replica","Replica","Time","Agent"]"#,
        );
        assert!(serde_json::from_str::<TrainingData>(&repeated).is_err());
    }

    #[test]
    fn dims_follow_the_layout() {
        let dims = data(AxisLayout::default(), [2, 3, 4, 5]).dims().unwrap();
        assert_eq!(
            dims,
            BatchDims {
                replicas: 2,
                agents: 5,
                time: 4,
                batch: 3
            }
        );
    }

    #[test]
    fn trajectories_do_not_depend_on_the_layout() {
        let default = data(AxisLayout::default(), [2, 3, 4, 5]);
        let layout = AxisLayout::new([
            AxisName::Agent,
            AxisName::Time,
            AxisName::Replica,
            AxisName::Batch,
        ])
        .unwrap();
        let other = data(layout, [5, 4, 2, 3]);

        let a = default.canonical().unwrap().trajectory(1, 3).unwrap();
        let b = other.canonical().unwrap().trajectory(1, 3).unwrap();
        assert_eq!(a, b);

        // replica 1, batch 2, time 3, agent 3
        assert_eq!(a.reward[[3, 2]], 1233.);
        assert_eq!(a.core_state.dim(), (3, 4));
        assert_eq!(a.core_state[[2, 0]], 1203.);
    }

    #[test]
    fn permuting_agents() {
        let data = data(AxisLayout::default(), [1, 2, 2, 3]);
        let permuted = data.permute_agents(&[2, 0, 1]).unwrap();

        let a = permuted.canonical().unwrap().trajectory(0, 0).unwrap();
        let b = data.canonical().unwrap().trajectory(0, 2).unwrap();
        assert_eq!(a, b);

        assert!(data.permute_agents(&[0, 0, 1]).is_err());
    }

    #[test]
    fn mismatched_fields_are_rejected() {
        let mut bad = data(AxisLayout::default(), [1, 2, 2, 3]);
        bad.reward = ArrayD::zeros(IxDyn(&[1, 2, 2, 4]));
        assert!(matches!(
            bad.dims(),
            Err(LearnerErr::LayoutMismatch { what: "reward", .. })
        ));

        let mut missing = data(AxisLayout::default(), [1, 2, 2, 3]);
        missing.extras.remove(LOGITS);
        assert!(matches!(
            missing.dims(),
            Err(LearnerErr::MissingExtra(LOGITS))
        ));
    }
}

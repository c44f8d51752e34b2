use ndarray::{ArrayD, ArrayView1, ArrayView2, Ix1, Ix2};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// A named array inside a `ParamTree`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    name: String,
    value: ArrayD<f32>,
}

impl Leaf {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }
}

/// An ordered collection of named parameter arrays.
///
/// Model parameters, gradients, optimizer moments and parameter deltas all share this layout, the
/// *structure* of a tree being the ordered list of its leaf names and shapes. Every binary
/// operation checks that both trees have the same structure before touching any value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamTree {
    leaves: Vec<Leaf>,
}

impl ParamTree {
    /// Creates a new empty `ParamTree`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new leaf to the tree.
    ///
    /// # Arguments
    /// * `name` - The unique name of the leaf.
    /// * `value` - The values of the leaf.
    ///
    /// # Returns
    /// An error if there's already a leaf with the same name.
    pub fn insert<S: Into<String>>(&mut self, name: S, value: ArrayD<f32>) -> Result<()> {
        let name = name.into();

        if self.leaves.iter().any(|leaf| leaf.name == name) {
            return Err(MlErr::DuplicateLeaf(name));
        }

        self.leaves.push(Leaf { name, value });
        Ok(())
    }

    /// Builder flavoured version of `insert`.
    pub fn with_leaf<S: Into<String>>(mut self, name: S, value: ArrayD<f32>) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Returns the amount of leaves in the tree.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Returns the amount of scalar parameters held across all leaves.
    pub fn size(&self) -> usize {
        self.leaves.iter().map(|leaf| leaf.value.len()).sum()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Leaf> {
        self.leaves.iter()
    }

    /// Looks up a leaf by name.
    ///
    /// # Arguments
    /// * `name` - The name of the leaf.
    ///
    /// # Returns
    /// The values of the leaf or an error if there's no such leaf.
    pub fn get(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.leaves
            .iter()
            .find(|leaf| leaf.name == name)
            .map(|leaf| &leaf.value)
            .ok_or_else(|| MlErr::MissingLeaf(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ArrayD<f32>> {
        self.leaves
            .iter_mut()
            .find(|leaf| leaf.name == name)
            .map(|leaf| &mut leaf.value)
            .ok_or_else(|| MlErr::MissingLeaf(name.to_string()))
    }

    /// Views a leaf as a matrix.
    ///
    /// # Returns
    /// An error if the leaf is missing or isn't two dimensional.
    pub fn matrix(&self, name: &str) -> Result<ArrayView2<'_, f32>> {
        Ok(self.get(name)?.view().into_dimensionality::<Ix2>()?)
    }

    /// Views a leaf as a vector.
    ///
    /// # Returns
    /// An error if the leaf is missing or isn't one dimensional.
    pub fn vector(&self, name: &str) -> Result<ArrayView1<'_, f32>> {
        Ok(self.get(name)?.view().into_dimensionality::<Ix1>()?)
    }

    /// Whether both trees have the same leaf names, order and shapes.
    pub fn same_structure(&self, other: &ParamTree) -> bool {
        self.leaves.len() == other.leaves.len()
            && self
                .leaves
                .iter()
                .zip(&other.leaves)
                .all(|(a, b)| a.name == b.name && a.value.shape() == b.value.shape())
    }

    /// Whether both trees have the same structure and bit for bit the same values, so that a
    /// `NaN` leaf equals itself.
    pub fn bitwise_eq(&self, other: &ParamTree) -> bool {
        self.same_structure(other)
            && self.leaves.iter().zip(&other.leaves).all(|(a, b)| {
                a.value
                    .iter()
                    .zip(&b.value)
                    .all(|(x, y)| x.to_bits() == y.to_bits())
            })
    }

    /// Checks that `other` has the same structure as this tree.
    ///
    /// # Arguments
    /// * `other` - The tree to check.
    /// * `what` - What `other` holds, used in the error.
    pub fn check_structure(&self, other: &ParamTree, what: &'static str) -> Result<()> {
        if self.same_structure(other) {
            Ok(())
        } else {
            Err(MlErr::StructureMismatch { what })
        }
    }

    /// Returns a tree with this tree's structure filled with `value`.
    pub fn full_like(&self, value: f32) -> Self {
        self.map(|_| value)
    }

    pub fn zeros_like(&self) -> Self {
        self.full_like(0.)
    }

    /// Applies `f` to every scalar, returning a new tree.
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        let leaves = self
            .leaves
            .iter()
            .map(|leaf| Leaf {
                name: leaf.name.clone(),
                value: leaf.value.mapv(&f),
            })
            .collect();

        Self { leaves }
    }

    /// Applies `f` to every scalar in place.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(&mut f32),
    {
        for leaf in &mut self.leaves {
            leaf.value.map_inplace(&f);
        }
    }

    /// Mutates every scalar of this tree using the matching scalar of `other`.
    ///
    /// # Returns
    /// An error if the structures don't match, in which case nothing is modified.
    pub fn zip_mut_with<F>(&mut self, other: &ParamTree, f: F) -> Result<()>
    where
        F: Fn(&mut f32, f32),
    {
        self.check_structure(other, "operand")?;

        for (leaf, other) in self.leaves.iter_mut().zip(&other.leaves) {
            leaf.value.zip_mut_with(&other.value, |a, &b| f(a, b));
        }

        Ok(())
    }

    /// Adds `other` into this tree, leaf by leaf.
    pub fn add_assign(&mut self, other: &ParamTree) -> Result<()> {
        self.zip_mut_with(other, |a, b| *a += b)
    }

    pub fn scale(&mut self, factor: f32) {
        self.map_inplace(|x| *x *= factor);
    }

    /// Computes the l2 norm of all the scalars in the tree taken as a single vector.
    pub fn global_norm(&self) -> f32 {
        self.leaves
            .iter()
            .flat_map(|leaf| leaf.value.iter())
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt()
    }

    /// Averages a set of trees with the same structure.
    ///
    /// The trees are summed in iteration order, so the result only depends on the order in which
    /// they are given.
    ///
    /// # Returns
    /// The element wise mean or an error if there are no trees or the structures don't match.
    pub fn mean<'a, I>(trees: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a ParamTree>,
    {
        let mut trees = trees.into_iter();
        let mut acc = trees
            .next()
            .ok_or(MlErr::InvalidInput("can't average an empty set of trees"))?
            .clone();

        let mut count = 1;
        for tree in trees {
            acc.add_assign(tree)?;
            count += 1;
        }

        let count = count as f32;
        acc.map_inplace(|x| *x /= count);
        Ok(acc)
    }
}

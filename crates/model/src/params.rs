use std::collections::BTreeMap;

use candle_core::{DType, Device, Error, Result, Shape, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Named trainable variables with deterministic seeded initialization.
///
/// Two stores built from the same seed and the same sequence of calls hold
/// identical values, which is what lets independent workers start from the
/// same replica before the first checkpoint exists.
#[derive(Debug)]
pub struct ParameterStore {
    vars: BTreeMap<String, Var>,
    rng: StdRng,
    dtype: DType,
    device: Device,
}

impl ParameterStore {
    pub fn new(seed: u64, dtype: DType, device: Device) -> Self {
        Self {
            vars: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            dtype,
            device,
        }
    }

    pub fn uniform<S: Into<Shape>>(&mut self, name: &str, shape: S, bound: f64) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.gen_range(-bound..bound) as f32)
            .collect();
        self.insert(name, Tensor::from_vec(values, shape, &self.device)?)
    }

    pub fn zeros<S: Into<Shape>>(&mut self, name: &str, shape: S) -> Result<Tensor> {
        let tensor = Tensor::zeros(shape, DType::F32, &self.device)?;
        self.insert(name, tensor)
    }

    pub fn constant<S: Into<Shape>>(&mut self, name: &str, shape: S, value: f64) -> Result<Tensor> {
        let tensor = Tensor::full(value as f32, shape, &self.device)?;
        self.insert(name, tensor)
    }

    fn insert(&mut self, name: &str, tensor: Tensor) -> Result<Tensor> {
        if self.vars.contains_key(name) {
            return Err(Error::Msg(format!("duplicate parameter name {name}")));
        }
        let tensor = tensor.to_dtype(self.dtype)?;
        let var = Var::from_tensor(&tensor)?;
        let handle = var.as_tensor().clone();
        self.vars.insert(name.to_string(), var);
        Ok(handle)
    }

    pub fn named(&self) -> Vec<(String, Var)> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

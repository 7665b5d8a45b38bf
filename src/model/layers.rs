//! Layer constructors and host forward passes

use super::module::{Combine, Module, ModuleKind};
use super::parameter::Parameter;
use crate::error::{shape_err, ForgeError, ForgeResult};
use crate::tensor::matmul::linear_f32;
use crate::tensor::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Xavier-uniform values for a `fan_in -> fan_out` mapping
fn xavier(count: usize, fan_in: usize, fan_out: usize, rng: &mut ChaCha8Rng) -> Vec<f32> {
    let scale = (6.0 / (fan_in + fan_out) as f32).sqrt();
    (0..count).map(|_| rng.gen_range(-scale..scale)).collect()
}

fn seeded_param(shape: Vec<usize>, fan_in: usize, fan_out: usize, rng: &mut ChaCha8Rng) -> ForgeResult<Parameter> {
    let count = shape.iter().product();
    Ok(Parameter::new(Tensor::from_vec(xavier(count, fan_in, fan_out, rng), shape)?))
}

impl Module {
    pub fn sequential(name: impl Into<String>, children: Vec<Module>) -> Self {
        Module::new(name, ModuleKind::Sequential).with_children(children)
    }

    pub fn parallel(name: impl Into<String>, combine: Combine, branches: Vec<Module>) -> Self {
        Module::new(name, ModuleKind::Parallel { combine }).with_children(branches)
    }

    /// Linear layer with Xavier weights and small seeded bias
    pub fn linear(name: impl Into<String>, in_features: usize, out_features: usize, seed: u64) -> ForgeResult<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let weight = seeded_param(vec![out_features, in_features], in_features, out_features, &mut rng)?;
        let bias: Vec<f32> = (0..out_features).map(|_| rng.gen_range(-0.1..0.1)).collect();

        Ok(Module::new(
            name,
            ModuleKind::Linear {
                in_features,
                out_features,
            },
        )
        .with_param("weight", weight)
        .with_param("bias", Parameter::new(Tensor::from_vec(bias, vec![out_features])?)))
    }

    /// Batch norm with unit affine parameters and identity running statistics
    pub fn batch_norm(name: impl Into<String>, num_features: usize) -> ForgeResult<Self> {
        Ok(Module::new(
            name,
            ModuleKind::BatchNorm {
                num_features,
                eps: 1e-5,
                running_mean: vec![0.0; num_features],
                running_var: vec![1.0; num_features],
            },
        )
        .with_param("weight", Parameter::new(Tensor::filled(vec![num_features], 1.0)))
        .with_param("bias", Parameter::new(Tensor::zeros(vec![num_features]))))
    }

    /// Replace running statistics and affine parameters with seeded non-trivial values
    pub fn with_random_stats(mut self, seed: u64) -> ForgeResult<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = match &mut self.kind {
            ModuleKind::BatchNorm {
                num_features,
                running_mean,
                running_var,
                ..
            } => {
                *running_mean = (0..*num_features).map(|_| rng.gen_range(-0.5..0.5)).collect();
                *running_var = (0..*num_features).map(|_| rng.gen_range(0.5..2.0)).collect();
                *num_features
            }
            _ => return Err(ForgeError::InvalidConfiguration(format!("{} is not a batch norm", self.name))),
        };
        let gamma: Vec<f32> = (0..n).map(|_| rng.gen_range(0.5..1.5)).collect();
        let beta: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.2..0.2)).collect();
        if let Some(w) = self.param_mut("weight") {
            w.data.assign_f32(&gamma)?;
        }
        if let Some(b) = self.param_mut("bias") {
            b.data.assign_f32(&beta)?;
        }
        Ok(self)
    }

    /// N-d convolution (`dims` in 1..=3), stride 1, no padding
    pub fn conv(
        name: impl Into<String>,
        dims: usize,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        seed: u64,
    ) -> ForgeResult<Self> {
        Self::conv_impl(name.into(), dims, false, in_channels, out_channels, kernel, seed)
    }

    pub fn conv_transpose(
        name: impl Into<String>,
        dims: usize,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        seed: u64,
    ) -> ForgeResult<Self> {
        Self::conv_impl(name.into(), dims, true, in_channels, out_channels, kernel, seed)
    }

    fn conv_impl(
        name: String,
        dims: usize,
        transposed: bool,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        seed: u64,
    ) -> ForgeResult<Self> {
        if !(1..=3).contains(&dims) || kernel == 0 {
            return Err(ForgeError::InvalidConfiguration(format!(
                "conv {} needs 1-3 spatial dims and a non-empty kernel",
                name
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let taps = kernel.pow(dims as u32);
        let mut shape = if transposed {
            vec![in_channels, out_channels]
        } else {
            vec![out_channels, in_channels]
        };
        shape.extend(std::iter::repeat(kernel).take(dims));

        let weight = seeded_param(shape, in_channels * taps, out_channels * taps, &mut rng)?;
        let bias: Vec<f32> = (0..out_channels).map(|_| rng.gen_range(-0.1..0.1)).collect();

        Ok(Module::new(
            name,
            ModuleKind::Conv {
                dims,
                transposed,
                in_channels,
                out_channels,
                kernel,
            },
        )
        .with_param("weight", weight)
        .with_param("bias", Parameter::new(Tensor::from_vec(bias, vec![out_channels])?)))
    }

    pub fn dropout(name: impl Into<String>, p: f32) -> Self {
        Module::new(name, ModuleKind::Dropout { p, seed: 0 })
    }

    pub fn relu(name: impl Into<String>) -> Self {
        Module::new(name, ModuleKind::ReLU)
    }

    pub fn identity(name: impl Into<String>) -> Self {
        Module::new(name, ModuleKind::Identity)
    }

    /// Single-layer LSTM with `weight_ih [4H, I]`, `weight_hh [4H, H]` and two biases
    pub fn lstm(name: impl Into<String>, input_size: usize, hidden_size: usize, seed: u64) -> ForgeResult<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let gates = 4 * hidden_size;
        let w_ih = seeded_param(vec![gates, input_size], input_size, hidden_size, &mut rng)?;
        let w_hh = seeded_param(vec![gates, hidden_size], hidden_size, hidden_size, &mut rng)?;
        let b_ih = seeded_param(vec![gates], hidden_size, hidden_size, &mut rng)?;
        let b_hh = seeded_param(vec![gates], hidden_size, hidden_size, &mut rng)?;

        Ok(Module::new(name, ModuleKind::Lstm { input_size, hidden_size })
            .with_param("weight_ih", w_ih)
            .with_param("weight_hh", w_hh)
            .with_param("bias_ih", b_ih)
            .with_param("bias_hh", b_hh))
    }

    pub fn embedding(name: impl Into<String>, num_embeddings: usize, dim: usize, seed: u64) -> ForgeResult<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let table = seeded_param(vec![num_embeddings, dim], num_embeddings, dim, &mut rng)?;
        Ok(Module::new(name, ModuleKind::Embedding { num_embeddings, dim }).with_param("weight", table))
    }

    pub fn conditional(name: impl Into<String>, threshold: f32, then_branch: Module, else_branch: Module) -> Self {
        Module::new(name, ModuleKind::Conditional { threshold })
            .with_child(then_branch)
            .with_child(else_branch)
    }

    pub fn opaque(name: impl Into<String>, type_name: impl Into<String>, children: Vec<Module>) -> Self {
        Module::new(
            name,
            ModuleKind::Opaque {
                type_name: type_name.into(),
            },
        )
        .with_children(children)
    }

    // ========== Forward ==========

    /// Run the module on `input`. Parameters are read as logical f32 values,
    /// so results do not depend on storage dtype beyond its rounding.
    pub fn forward(&self, input: &Tensor) -> ForgeResult<Tensor> {
        match &self.kind {
            ModuleKind::Sequential | ModuleKind::Opaque { .. } => {
                let mut x = input.clone();
                for child in self.children() {
                    x = child.forward(&x)?;
                }
                Ok(x)
            }
            ModuleKind::Parallel { combine } => {
                let outputs = self
                    .children()
                    .iter()
                    .map(|c| c.forward(input))
                    .collect::<ForgeResult<Vec<_>>>()?;
                combine_outputs(*combine, &outputs)
            }
            ModuleKind::Linear {
                in_features,
                out_features,
            } => self.linear_forward(input, *in_features, *out_features),
            ModuleKind::ConcatLinear {
                in_features,
                splits,
                combine,
            } => {
                let total: usize = splits.iter().sum();
                let merged = self.linear_forward(input, *in_features, total)?;
                split_and_combine(&merged, splits, *combine)
            }
            ModuleKind::BatchNorm {
                num_features,
                eps,
                running_mean,
                running_var,
            } => self.batch_norm_forward(input, *num_features, *eps, running_mean, running_var),
            ModuleKind::Conv {
                dims,
                transposed,
                in_channels,
                out_channels,
                kernel,
            } => self.conv_forward(input, *dims, *transposed, *in_channels, *out_channels, *kernel),
            ModuleKind::Dropout { p, seed } => {
                if !self.is_training() || *p <= 0.0 {
                    return Ok(input.clone());
                }
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                let keep = 1.0 - p;
                let values: Vec<f32> = input
                    .to_f32_vec()
                    .into_iter()
                    .map(|v| if rng.gen::<f32>() < keep { v / keep } else { 0.0 })
                    .collect();
                Tensor::from_vec(values, input.shape().to_vec())
            }
            ModuleKind::Identity => Ok(input.clone()),
            ModuleKind::ReLU => {
                let values = input.to_f32_vec().into_iter().map(|v| v.max(0.0)).collect();
                Tensor::from_vec(values, input.shape().to_vec())
            }
            ModuleKind::Lstm {
                input_size,
                hidden_size,
            } => self.lstm_forward(input, *input_size, *hidden_size, false),
            ModuleKind::FusedLstm {
                input_size,
                hidden_size,
            } => self.lstm_forward(input, *input_size, *hidden_size, true),
            ModuleKind::Embedding { num_embeddings, dim } => {
                self.embedding_forward(input, *num_embeddings, *dim)
            }
            ModuleKind::Conditional { threshold } => {
                let values = input.to_f32_vec();
                let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                let branch = if mean > *threshold { 0 } else { 1 };
                match self.children().get(branch) {
                    Some(child) => child.forward(input),
                    None => Ok(input.clone()),
                }
            }
        }
    }

    fn required(&self, name: &str) -> ForgeResult<Vec<f32>> {
        self.param(name)
            .map(|p| p.data.to_f32_vec())
            .ok_or_else(|| shape_err(&format!("{} has no '{}' parameter", self.name, name)))
    }

    fn optional(&self, name: &str) -> Option<Vec<f32>> {
        self.param(name).map(|p| p.data.to_f32_vec())
    }

    fn linear_forward(&self, input: &Tensor, in_features: usize, out_features: usize) -> ForgeResult<Tensor> {
        let shape = input.shape();
        if shape.last().copied() != Some(in_features) {
            return Err(ForgeError::ShapeMismatch(format!(
                "{}: expected trailing dim {}, got {:?}",
                self.name, in_features, shape
            )));
        }
        let rows = input.numel() / in_features;
        let weight = self.required("weight")?;
        let bias = self.optional("bias");
        let y = linear_f32(&input.to_f32_vec(), &weight, bias.as_deref(), rows, out_features, in_features)?;

        let mut out_shape = shape.to_vec();
        if let Some(last) = out_shape.last_mut() {
            *last = out_features;
        }
        Tensor::from_vec(y, out_shape)
    }

    fn batch_norm_forward(
        &self,
        input: &Tensor,
        num_features: usize,
        eps: f32,
        mean: &[f32],
        var: &[f32],
    ) -> ForgeResult<Tensor> {
        let shape = input.shape();
        if shape.len() < 2 || shape[1] != num_features {
            return Err(ForgeError::ShapeMismatch(format!(
                "{}: expected {} channels in dim 1, got {:?}",
                self.name, num_features, shape
            )));
        }
        let gamma = self.required("weight")?;
        let beta = self.required("bias")?;
        let inner: usize = shape[2..].iter().product();

        let mut values = input.to_f32_vec();
        for (i, v) in values.iter_mut().enumerate() {
            let c = (i / inner) % num_features;
            *v = (*v - mean[c]) / (var[c] + eps).sqrt() * gamma[c] + beta[c];
        }
        Tensor::from_vec(values, shape.to_vec())
    }

    fn conv_forward(
        &self,
        input: &Tensor,
        dims: usize,
        transposed: bool,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> ForgeResult<Tensor> {
        let shape = input.shape();
        if shape.len() != dims + 2 || shape[1] != in_channels {
            return Err(ForgeError::ShapeMismatch(format!(
                "{}: expected [N, {}, {} spatial dims], got {:?}",
                self.name, in_channels, dims, shape
            )));
        }
        let in_spatial = &shape[2..];
        let out_spatial: Vec<usize> = if transposed {
            in_spatial.iter().map(|s| s + kernel - 1).collect()
        } else {
            if in_spatial.iter().any(|&s| s < kernel) {
                return Err(shape_err(&format!("{}: input smaller than kernel", self.name)));
            }
            in_spatial.iter().map(|s| s - kernel + 1).collect()
        };

        let weight = self.required("weight")?;
        let bias = self.optional("bias");
        let x = input.to_f32_vec();
        let batch = shape[0];
        let kernel_shape = vec![kernel; dims];
        let taps: usize = kernel_shape.iter().product();
        let in_size: usize = in_spatial.iter().product();
        let out_size: usize = out_spatial.iter().product();

        let mut y = vec![0.0f32; batch * out_channels * out_size];
        for n in 0..batch {
            for oc in 0..out_channels {
                let b = bias.as_ref().map(|b| b[oc]).unwrap_or(0.0);
                for o in 0..out_size {
                    y[(n * out_channels + oc) * out_size + o] = b;
                }
            }
        }

        if transposed {
            // Scatter each input position through the kernel
            for n in 0..batch {
                for ic in 0..in_channels {
                    for i in 0..in_size {
                        let pos = unravel(i, in_spatial);
                        let xv = x[(n * in_channels + ic) * in_size + i];
                        for oc in 0..out_channels {
                            for t in 0..taps {
                                let tap = unravel(t, &kernel_shape);
                                let out_pos: Vec<usize> = pos.iter().zip(&tap).map(|(p, k)| p + k).collect();
                                let o = ravel(&out_pos, &out_spatial);
                                let w = weight[(ic * out_channels + oc) * taps + t];
                                y[(n * out_channels + oc) * out_size + o] += xv * w;
                            }
                        }
                    }
                }
            }
        } else {
            for n in 0..batch {
                for oc in 0..out_channels {
                    for o in 0..out_size {
                        let pos = unravel(o, &out_spatial);
                        let mut sum = 0.0f32;
                        for ic in 0..in_channels {
                            for t in 0..taps {
                                let tap = unravel(t, &kernel_shape);
                                let in_pos: Vec<usize> = pos.iter().zip(&tap).map(|(p, k)| p + k).collect();
                                let i = ravel(&in_pos, in_spatial);
                                sum += x[(n * in_channels + ic) * in_size + i]
                                    * weight[(oc * in_channels + ic) * taps + t];
                            }
                        }
                        y[(n * out_channels + oc) * out_size + o] += sum;
                    }
                }
            }
        }

        let mut out_shape = vec![batch, out_channels];
        out_shape.extend(out_spatial);
        Tensor::from_vec(y, out_shape)
    }

    fn lstm_forward(&self, input: &Tensor, input_size: usize, hidden: usize, fused: bool) -> ForgeResult<Tensor> {
        let shape = input.shape();
        if shape.len() != 3 || shape[2] != input_size {
            return Err(ForgeError::ShapeMismatch(format!(
                "{}: expected [T, N, {}], got {:?}",
                self.name, input_size, shape
            )));
        }
        let (steps, batch) = (shape[0], shape[1]);
        let gates = 4 * hidden;
        let w_ih = self.required("weight_ih")?;
        let w_hh = self.required("weight_hh")?;
        let b_ih = self.required("bias_ih")?;
        let b_hh = self.required("bias_hh")?;
        let x = input.to_f32_vec();

        // Fused variant projects every timestep through W_ih in one GEMM
        let projected = if fused {
            Some(linear_f32(&x, &w_ih, Some(&b_ih), steps * batch, gates, input_size)?)
        } else {
            None
        };

        let mut h = vec![0.0f32; batch * hidden];
        let mut c = vec![0.0f32; batch * hidden];
        let mut out = Vec::with_capacity(steps * batch * hidden);

        for t in 0..steps {
            let step_rows = t * batch * gates..(t + 1) * batch * gates;
            let ih = match &projected {
                Some(all) => all[step_rows].to_vec(),
                None => {
                    let xt = &x[t * batch * input_size..(t + 1) * batch * input_size];
                    linear_f32(xt, &w_ih, Some(&b_ih), batch, gates, input_size)?
                }
            };
            let hh = linear_f32(&h, &w_hh, Some(&b_hh), batch, gates, hidden)?;

            for n in 0..batch {
                for j in 0..hidden {
                    let g = |k: usize| ih[n * gates + k * hidden + j] + hh[n * gates + k * hidden + j];
                    let i_gate = sigmoid(g(0));
                    let f_gate = sigmoid(g(1));
                    let g_gate = g(2).tanh();
                    let o_gate = sigmoid(g(3));
                    let idx = n * hidden + j;
                    c[idx] = f_gate * c[idx] + i_gate * g_gate;
                    h[idx] = o_gate * c[idx].tanh();
                }
            }
            out.extend_from_slice(&h);
        }
        Tensor::from_vec(out, vec![steps, batch, hidden])
    }

    fn embedding_forward(&self, input: &Tensor, num_embeddings: usize, dim: usize) -> ForgeResult<Tensor> {
        let table = self.required("weight")?;
        let mut out = Vec::with_capacity(input.numel() * dim);
        for v in input.to_f32_vec() {
            let idx = v as usize;
            if v < 0.0 || idx >= num_embeddings {
                return Err(ForgeError::ShapeMismatch(format!(
                    "{}: index {} outside table of {}",
                    self.name, v, num_embeddings
                )));
            }
            out.extend_from_slice(&table[idx * dim..(idx + 1) * dim]);
        }
        let mut shape = input.shape().to_vec();
        shape.push(dim);
        Tensor::from_vec(out, shape)
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn unravel(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut pos = vec![0; dims.len()];
    for (slot, &d) in pos.iter_mut().zip(dims).rev() {
        *slot = index % d;
        index /= d;
    }
    pos
}

fn ravel(pos: &[usize], dims: &[usize]) -> usize {
    pos.iter().zip(dims).fold(0, |acc, (p, d)| acc * d + p)
}

fn combine_outputs(combine: Combine, outputs: &[Tensor]) -> ForgeResult<Tensor> {
    let first = outputs
        .first()
        .ok_or_else(|| shape_err("parallel block has no branches"))?;
    match combine {
        Combine::Sum => {
            let mut acc = first.to_f32_vec();
            for out in &outputs[1..] {
                if out.shape() != first.shape() {
                    return Err(ForgeError::ShapeMismatch(format!(
                        "cannot sum branch outputs {:?} and {:?}",
                        first.shape(),
                        out.shape()
                    )));
                }
                for (a, b) in acc.iter_mut().zip(out.to_f32_vec()) {
                    *a += b;
                }
            }
            Tensor::from_vec(acc, first.shape().to_vec())
        }
        Combine::Concat => {
            let lead = &first.shape()[..first.shape().len().saturating_sub(1)];
            let rows: usize = lead.iter().product();
            let widths: Vec<usize> = outputs
                .iter()
                .map(|o| o.shape().last().copied().unwrap_or(1))
                .collect();
            let total: usize = widths.iter().sum();
            let values: Vec<Vec<f32>> = outputs.iter().map(Tensor::to_f32_vec).collect();

            let mut out = Vec::with_capacity(rows * total);
            for r in 0..rows {
                for (v, w) in values.iter().zip(&widths) {
                    out.extend_from_slice(&v[r * w..(r + 1) * w]);
                }
            }
            let mut shape = lead.to_vec();
            shape.push(total);
            Tensor::from_vec(out, shape)
        }
    }
}

fn split_and_combine(merged: &Tensor, splits: &[usize], combine: Combine) -> ForgeResult<Tensor> {
    if combine == Combine::Concat {
        return Ok(merged.clone());
    }
    let total: usize = splits.iter().sum();
    let values = merged.to_f32_vec();
    let rows = values.len() / total.max(1);
    let mut parts = Vec::with_capacity(splits.len());
    let mut offset = 0;
    let lead = &merged.shape()[..merged.shape().len() - 1];
    for &w in splits {
        let mut part = Vec::with_capacity(rows * w);
        for r in 0..rows {
            part.extend_from_slice(&values[r * total + offset..r * total + offset + w]);
        }
        let mut shape = lead.to_vec();
        shape.push(w);
        parts.push(Tensor::from_vec(part, shape)?);
        offset += w;
    }
    combine_outputs(combine, &parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(shape: Vec<usize>, seed: u64) -> Tensor {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = shape.iter().product();
        Tensor::from_vec((0..n).map(|_| rng.gen_range(-1.0..1.0)).collect(), shape).unwrap()
    }

    #[test]
    fn test_linear_is_deterministic_per_seed() {
        let a = Module::linear("fc", 4, 3, 7).unwrap();
        let b = Module::linear("fc", 4, 3, 7).unwrap();
        assert_eq!(
            a.param("weight").unwrap().data.to_f32_vec(),
            b.param("weight").unwrap().data.to_f32_vec()
        );
    }

    #[test]
    fn test_linear_forward_shape() {
        let fc = Module::linear("fc", 4, 3, 1).unwrap();
        let y = fc.forward(&input(vec![2, 5, 4], 0)).unwrap();
        assert_eq!(y.shape(), &[2, 5, 3]);
        assert!(fc.forward(&input(vec![2, 3], 0)).is_err());
    }

    #[test]
    fn test_batch_norm_identity_stats() {
        let bn = Module::batch_norm("bn", 3).unwrap();
        let x = input(vec![2, 3], 1);
        let y = bn.forward(&x).unwrap();
        assert!(y.max_abs_diff(&x).unwrap() < 1e-4);
    }

    #[test]
    fn test_conv_output_shapes() {
        let c1 = Module::conv("c1", 1, 2, 4, 3, 0).unwrap();
        assert_eq!(c1.forward(&input(vec![1, 2, 8], 0)).unwrap().shape(), &[1, 4, 6]);

        let c2 = Module::conv("c2", 2, 2, 3, 2, 0).unwrap();
        assert_eq!(c2.forward(&input(vec![2, 2, 4, 5], 0)).unwrap().shape(), &[2, 3, 3, 4]);

        let t2 = Module::conv_transpose("t2", 2, 2, 3, 2, 0).unwrap();
        assert_eq!(t2.forward(&input(vec![1, 2, 3, 3], 0)).unwrap().shape(), &[1, 3, 4, 4]);
    }

    #[test]
    fn test_conv_1x1_matches_linear() {
        let conv = Module::conv("c", 1, 3, 2, 1, 5).unwrap();
        let x = input(vec![1, 3, 1], 2);
        let y = conv.forward(&x).unwrap().to_f32_vec();

        let w = conv.param("weight").unwrap().data.to_f32_vec();
        let b = conv.param("bias").unwrap().data.to_f32_vec();
        let xv = x.to_f32_vec();
        for oc in 0..2 {
            let expected: f32 = (0..3).map(|ic| w[oc * 3 + ic] * xv[ic]).sum::<f32>() + b[oc];
            assert!((y[oc] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_fused_lstm_matches_plain() {
        let plain = Module::lstm("rnn", 3, 4, 9).unwrap();
        let mut fused = Module::lstm("rnn", 3, 4, 9).unwrap();
        fused.kind = ModuleKind::FusedLstm {
            input_size: 3,
            hidden_size: 4,
        };
        let x = input(vec![5, 2, 3], 3);
        let a = plain.forward(&x).unwrap();
        let b = fused.forward(&x).unwrap();
        assert_eq!(a.shape(), &[5, 2, 4]);
        assert!(a.max_abs_diff(&b).unwrap() < 1e-6);
    }

    #[test]
    fn test_dropout_only_active_in_training() {
        let mut drop = Module::dropout("drop", 0.5);
        let x = Tensor::filled(vec![64], 1.0);
        assert_eq!(drop.forward(&x).unwrap(), x);

        drop.train(true);
        let y = drop.forward(&x).unwrap().to_f32_vec();
        assert!(y.iter().any(|&v| v == 0.0));
        assert!(y.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_embedding_lookup() {
        let emb = Module::embedding("emb", 5, 2, 0).unwrap();
        let ids = Tensor::from_vec(vec![0.0, 4.0], vec![2]).unwrap();
        let y = emb.forward(&ids).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        let bad = Tensor::from_vec(vec![5.0], vec![1]).unwrap();
        assert!(emb.forward(&bad).is_err());
    }

    #[test]
    fn test_conditional_picks_branch() {
        let cond = Module::conditional("gate", 0.0, Module::identity("then"), Module::relu("else"));
        let pos = Tensor::from_vec(vec![1.0, -0.5], vec![2]).unwrap();
        let neg = Tensor::from_vec(vec![-1.0, 0.5], vec![2]).unwrap();
        assert_eq!(cond.forward(&pos).unwrap().to_f32_vec(), vec![1.0, -0.5]);
        assert_eq!(cond.forward(&neg).unwrap().to_f32_vec(), vec![0.0, 0.5]);
    }

    #[test]
    fn test_parallel_concat_and_sum() {
        let branches = || {
            vec![
                Module::linear("a", 3, 2, 1).unwrap(),
                Module::linear("b", 3, 2, 2).unwrap(),
            ]
        };
        let x = input(vec![4, 3], 0);
        let cat = Module::parallel("cat", Combine::Concat, branches());
        assert_eq!(cat.forward(&x).unwrap().shape(), &[4, 4]);
        let sum = Module::parallel("sum", Combine::Sum, branches());
        assert_eq!(sum.forward(&x).unwrap().shape(), &[4, 2]);
    }
}

//! Neural Collaborative Filtering network
//!
//! User and item embeddings are concatenated and passed through a stack of dense blocks
//! (linear, ReLU, batch normalization, dropout), then a single logistic output unit.
//!
//! Training minimizes binary cross-entropy against the implicit rating used as a soft
//! label, with mini-batch Adam. Gradients are derived by hand over `ndarray` buffers; the
//! forward pass used for inference reads the batch-norm running statistics and skips
//! dropout.

use ndarray::{s, Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use crate::config::{ModelConfig, TrainingConfig};
use crate::error::{Error, Result};

const BN_EPS: f32 = 1e-5;
const BN_MOMENTUM: f32 = 0.1;
const PROB_EPS: f32 = 1e-7;

/// One supervised example
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSample {
    pub user: usize,
    pub item: usize,
    pub label: f32,
}

#[derive(Debug, Clone)]
struct Linear {
    /// `in x out`
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    /// Xavier-uniform weights, zero bias
    fn xavier(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Self {
        let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
        let weight = Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-bound..bound));
        Self {
            weight,
            bias: Array1::zeros(fan_out),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }
}

#[derive(Debug, Clone)]
struct BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
}

impl BatchNorm {
    fn new(width: usize) -> Self {
        Self {
            gamma: Array1::ones(width),
            beta: Array1::zeros(width),
            running_mean: Array1::zeros(width),
            running_var: Array1::ones(width),
        }
    }

    fn forward_eval(&self, a: &Array2<f32>) -> Array2<f32> {
        let invstd = self.running_var.mapv(|v| 1.0 / (v + BN_EPS).sqrt());
        let xhat = (a - &self.running_mean) * &invstd;
        xhat * &self.gamma + &self.beta
    }
}

#[derive(Debug, Clone)]
struct DenseBlock {
    linear: Linear,
    norm: BatchNorm,
}

/// Intermediate values of one block kept for the backward pass
struct BlockTrace {
    input: Array2<f32>,
    pre_activation: Array2<f32>,
    xhat: Array2<f32>,
    invstd: Array1<f32>,
    batch_mean: Array1<f32>,
    batch_var: Array1<f32>,
    /// Inverted-dropout mask, already scaled by `1 / keep`
    mask: Option<Array2<f32>>,
}

struct ForwardTrace {
    blocks: Vec<BlockTrace>,
    last_hidden: Array2<f32>,
    probabilities: Array1<f32>,
}

struct Gradients {
    user_embedding: Array2<f32>,
    item_embedding: Array2<f32>,
    blocks: Vec<BlockGradients>,
    output_weight: Array2<f32>,
    output_bias: Array1<f32>,
}

struct BlockGradients {
    weight: Array2<f32>,
    bias: Array1<f32>,
    gamma: Array1<f32>,
    beta: Array1<f32>,
}

/// Adam with bias correction
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step: i32,
    moments: Vec<(ArrayD<f32>, ArrayD<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            moments: Vec::new(),
        }
    }

    fn update(&mut self, params: Vec<(ArrayViewMutD<'_, f32>, ArrayViewD<'_, f32>)>) {
        if self.moments.is_empty() {
            self.moments = params
                .iter()
                .map(|(p, _)| (ArrayD::zeros(p.raw_dim()), ArrayD::zeros(p.raw_dim())))
                .collect();
        }
        self.step += 1;

        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        let correction1 = 1.0 - beta1.powi(self.step);
        let correction2 = 1.0 - beta2.powi(self.step);
        let step_size = self.learning_rate / correction1;

        for ((mut param, grad), (m, v)) in params.into_iter().zip(self.moments.iter_mut()) {
            Zip::from(&mut param)
                .and(&grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= step_size * *m / ((*v / correction2).sqrt() + eps);
                });
        }
    }
}

/// Embedding + feed-forward relevance model
#[derive(Debug, Clone)]
pub struct NcfModel {
    user_embedding: Array2<f32>,
    item_embedding: Array2<f32>,
    blocks: Vec<DenseBlock>,
    output: Linear,
    dropout: f32,
}

impl NcfModel {
    /// Freshly initialized model for the given vocabulary sizes
    pub fn new(
        num_users: usize,
        num_items: usize,
        config: &ModelConfig,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if num_users == 0 || num_items == 0 {
            return Err(Error::training("cannot build a model over an empty vocabulary"));
        }

        let normal = Normal::new(0.0f32, config.embedding_init_std)
            .map_err(|e| Error::training(format!("invalid embedding initializer: {}", e)))?;
        let dim = config.embedding_dim;
        let user_embedding = Array2::from_shape_fn((num_users, dim), |_| normal.sample(rng));
        let item_embedding = Array2::from_shape_fn((num_items, dim), |_| normal.sample(rng));

        let mut blocks = Vec::with_capacity(config.hidden_layers.len());
        let mut width = dim * 2;
        for &out in &config.hidden_layers {
            blocks.push(DenseBlock {
                linear: Linear::xavier(width, out, rng),
                norm: BatchNorm::new(out),
            });
            width = out;
        }
        let output = Linear::xavier(width, 1, rng);

        Ok(Self {
            user_embedding,
            item_embedding,
            blocks,
            output,
            dropout: config.dropout,
        })
    }

    pub fn num_users(&self) -> usize {
        self.user_embedding.nrows()
    }

    pub fn num_items(&self) -> usize {
        self.item_embedding.nrows()
    }

    pub fn embedding_dim(&self) -> usize {
        self.user_embedding.ncols()
    }

    /// Train for `config.epochs` passes over `samples`, reshuffling each epoch.
    /// Returns the mean loss of every epoch.
    pub fn fit(
        &mut self,
        samples: &[TrainingSample],
        config: &TrainingConfig,
        rng: &mut StdRng,
    ) -> Result<Vec<f32>> {
        if samples.is_empty() {
            return Err(Error::training("no training samples"));
        }
        for sample in samples {
            if sample.user >= self.num_users() || sample.item >= self.num_items() {
                return Err(Error::training(format!(
                    "sample ({}, {}) outside the fitted vocabulary",
                    sample.user, sample.item
                )));
            }
        }

        let batch_size = config.batch_size.max(1);
        let mut optimizer = Adam::new(config.learning_rate);
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut epoch_losses = Vec::with_capacity(config.epochs);

        for epoch in 0..config.epochs {
            order.shuffle(rng);
            let mut total = 0.0f64;

            for chunk in order.chunks(batch_size) {
                let batch: Vec<TrainingSample> = chunk.iter().map(|&i| samples[i]).collect();
                let loss = self.train_batch(&batch, &mut optimizer, rng);
                total += f64::from(loss) * batch.len() as f64;
            }

            let mean = (total / samples.len() as f64) as f32;
            if !mean.is_finite() {
                return Err(Error::training(format!("loss diverged at epoch {}", epoch + 1)));
            }
            info!("Epoch {}/{}, loss: {:.4}", epoch + 1, config.epochs, mean);
            epoch_losses.push(mean);
        }

        Ok(epoch_losses)
    }

    /// One optimizer step; returns the batch loss
    fn train_batch(&mut self, batch: &[TrainingSample], optimizer: &mut Adam, rng: &mut StdRng) -> f32 {
        let trace = self.forward_train(batch, Some(rng));
        let labels: Array1<f32> = batch.iter().map(|s| s.label).collect();
        let loss = bce_loss(&trace.probabilities, &labels);

        let grads = self.backward(batch, &trace, &labels);
        self.update_running_stats(&trace, batch.len());
        optimizer.update(self.param_grads(&grads));
        loss
    }

    fn embed(&self, users: &[usize], items: &[usize]) -> Array2<f32> {
        let dim = self.embedding_dim();
        let mut x = Array2::zeros((users.len(), dim * 2));
        x.slice_mut(s![.., ..dim])
            .assign(&self.user_embedding.select(Axis(0), users));
        x.slice_mut(s![.., dim..])
            .assign(&self.item_embedding.select(Axis(0), items));
        x
    }

    /// Training-mode forward pass over batch statistics. Dropout is applied only when an
    /// rng is supplied.
    fn forward_train(&self, batch: &[TrainingSample], mut rng: Option<&mut StdRng>) -> ForwardTrace {
        let users: Vec<usize> = batch.iter().map(|s| s.user).collect();
        let items: Vec<usize> = batch.iter().map(|s| s.item).collect();
        let rows = batch.len() as f32;
        let keep = 1.0 - self.dropout;

        let mut x = self.embed(&users, &items);
        let mut traces = Vec::with_capacity(self.blocks.len());

        for block in &self.blocks {
            let pre_activation = block.linear.forward(&x);
            let activated = pre_activation.mapv(|v| v.max(0.0));

            let batch_mean = activated.sum_axis(Axis(0)) / rows;
            let centered = &activated - &batch_mean;
            let batch_var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / rows;
            let invstd = batch_var.mapv(|v| 1.0 / (v + BN_EPS).sqrt());
            let xhat = &centered * &invstd;
            let mut out = &xhat * &block.norm.gamma + &block.norm.beta;

            let mask = match rng.as_deref_mut() {
                Some(rng) if self.dropout > 0.0 => {
                    let mask = Array2::from_shape_fn(out.raw_dim(), |_| {
                        if rng.gen::<f32>() < keep {
                            1.0 / keep
                        } else {
                            0.0
                        }
                    });
                    out *= &mask;
                    Some(mask)
                }
                _ => None,
            };

            traces.push(BlockTrace {
                input: std::mem::replace(&mut x, out),
                pre_activation,
                xhat,
                invstd,
                batch_mean,
                batch_var,
                mask,
            });
        }

        let logits = self.output.forward(&x).column(0).to_owned();
        ForwardTrace {
            blocks: traces,
            last_hidden: x,
            probabilities: logits.mapv(sigmoid),
        }
    }

    fn backward(&self, batch: &[TrainingSample], trace: &ForwardTrace, labels: &Array1<f32>) -> Gradients {
        let rows = batch.len() as f32;

        // d(BCE)/d(logit) for a sigmoid output
        let d_logit = ((&trace.probabilities - labels) / rows).insert_axis(Axis(1));
        let output_weight = trace.last_hidden.t().dot(&d_logit);
        let output_bias = d_logit.sum_axis(Axis(0));
        let mut dx = d_logit.dot(&self.output.weight.t());

        let mut block_grads = Vec::with_capacity(self.blocks.len());
        for (block, bt) in self.blocks.iter().zip(&trace.blocks).rev() {
            let dy = match &bt.mask {
                Some(mask) => &dx * mask,
                None => dx,
            };

            let gamma = (&dy * &bt.xhat).sum_axis(Axis(0));
            let beta = dy.sum_axis(Axis(0));

            let dxhat = &dy * &block.norm.gamma;
            let sum_dxhat = dxhat.sum_axis(Axis(0));
            let sum_dxhat_xhat = (&dxhat * &bt.xhat).sum_axis(Axis(0));
            let mut da = &dxhat * rows;
            da -= &sum_dxhat;
            da -= &(&bt.xhat * &sum_dxhat_xhat);
            da *= &(&bt.invstd / rows);

            Zip::from(&mut da)
                .and(&bt.pre_activation)
                .for_each(|g, &z| {
                    if z <= 0.0 {
                        *g = 0.0;
                    }
                });

            block_grads.push(BlockGradients {
                weight: bt.input.t().dot(&da),
                bias: da.sum_axis(Axis(0)),
                gamma,
                beta,
            });
            dx = da.dot(&block.linear.weight.t());
        }
        block_grads.reverse();

        let dim = self.embedding_dim();
        let mut user_embedding = Array2::zeros(self.user_embedding.raw_dim());
        let mut item_embedding = Array2::zeros(self.item_embedding.raw_dim());
        for (row, sample) in batch.iter().enumerate() {
            user_embedding
                .row_mut(sample.user)
                .scaled_add(1.0, &dx.slice(s![row, ..dim]));
            item_embedding
                .row_mut(sample.item)
                .scaled_add(1.0, &dx.slice(s![row, dim..]));
        }

        Gradients {
            user_embedding,
            item_embedding,
            blocks: block_grads,
            output_weight,
            output_bias,
        }
    }

    fn update_running_stats(&mut self, trace: &ForwardTrace, rows: usize) {
        // A single-row batch has no variance estimate
        if rows < 2 {
            return;
        }
        let unbias = rows as f32 / (rows - 1) as f32;
        for (block, bt) in self.blocks.iter_mut().zip(&trace.blocks) {
            let norm = &mut block.norm;
            norm.running_mean = &norm.running_mean * (1.0 - BN_MOMENTUM) + &bt.batch_mean * BN_MOMENTUM;
            norm.running_var =
                &norm.running_var * (1.0 - BN_MOMENTUM) + &bt.batch_var * (BN_MOMENTUM * unbias);
        }
    }

    /// Parameters paired with their gradients, in a fixed order
    fn param_grads<'a>(
        &'a mut self,
        grads: &'a Gradients,
    ) -> Vec<(ArrayViewMutD<'a, f32>, ArrayViewD<'a, f32>)> {
        let mut pairs = vec![
            (
                self.user_embedding.view_mut().into_dyn(),
                grads.user_embedding.view().into_dyn(),
            ),
            (
                self.item_embedding.view_mut().into_dyn(),
                grads.item_embedding.view().into_dyn(),
            ),
        ];
        for (block, g) in self.blocks.iter_mut().zip(&grads.blocks) {
            pairs.push((block.linear.weight.view_mut().into_dyn(), g.weight.view().into_dyn()));
            pairs.push((block.linear.bias.view_mut().into_dyn(), g.bias.view().into_dyn()));
            pairs.push((block.norm.gamma.view_mut().into_dyn(), g.gamma.view().into_dyn()));
            pairs.push((block.norm.beta.view_mut().into_dyn(), g.beta.view().into_dyn()));
        }
        pairs.push((
            self.output.weight.view_mut().into_dyn(),
            grads.output_weight.view().into_dyn(),
        ));
        pairs.push((
            self.output.bias.view_mut().into_dyn(),
            grads.output_bias.view().into_dyn(),
        ));
        pairs
    }

    /// Inference forward pass for aligned `(users[i], items[i])` pairs
    pub fn predict(&self, users: &[usize], items: &[usize]) -> Array1<f32> {
        let mut x = self.embed(users, items);
        for block in &self.blocks {
            let activated = block.linear.forward(&x).mapv(|v| v.max(0.0));
            x = block.norm.forward_eval(&activated);
        }
        self.output.forward(&x).column(0).mapv(sigmoid)
    }

    /// Probabilities of `user` against every index in `items`
    pub fn score_items(&self, user: usize, items: &[usize]) -> Vec<f32> {
        let users = vec![user; items.len()];
        let scores = self.predict(&users, items);
        debug!("Scored {} items for user index {}", items.len(), user);
        scores.to_vec()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Mean binary cross-entropy with soft labels
fn bce_loss(probabilities: &Array1<f32>, labels: &Array1<f32>) -> f32 {
    let rows = probabilities.len().max(1) as f32;
    let total: f32 = probabilities
        .iter()
        .zip(labels.iter())
        .map(|(&p, &y)| {
            let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    total / rows
}

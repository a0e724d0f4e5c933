//! Neural Network Layers
//!
//! Layer implementations for the fine-tuned transformer. Every layer
//! provides an explicit forward *and* backward pass.
//!
//! ## Design Pattern
//!
//! Parameters live in one central [`Parameters`](crate::model::Parameters)
//! set (the optimizer and pretrained loader need a single canonical
//! ordering), so layers here are functions over borrowed tensors rather than
//! parameter-owning structs:
//!
//! ```rust,ignore
//! pub fn layer_forward(x: &Tensor, ...params) -> (Tensor, Cache);
//! pub fn layer_backward(grad: &Tensor, ...params, cache: &Cache) -> Gradients;
//! ```
//!
//! The `Cache` holds whatever the backward pass needs from the forward pass;
//! the `Gradients` struct carries parameter gradients plus the gradient to
//! hand to the previous layer.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{attention_backward, attention_forward, AttentionCache, AttentionGradients};
pub use block::{block_backward, block_forward, BlockCache, BlockGrads, BlockParams};
pub use dropout::{dropout_backward, dropout_forward, DropoutCache};
pub use layer_norm::{layer_norm_backward, layer_norm_forward, LayerNormCache, LayerNormGradients};
pub use linear::{linear_backward, linear_forward, randn_init, LinearCache, LinearGradients};
pub use mlp::{mlp_backward, mlp_forward, MlpCache, MlpGradients};

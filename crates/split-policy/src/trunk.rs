//! Convolutional feature trunk shared by the rule and split heads.
//!
//! ```text
//! [B, H, W, C] ──permute──► [B, C, H, W]
//!   conv0..conv2   3×3, stride 1, ReLU   (full resolution)
//!   conv3..conv6   3×3, stride 2, ReLU   (downsampling)
//! ──flatten──► [B, filters · S · S]
//! ```
//!
//! Padding is "valid" and there is neither pooling nor normalisation: striding
//! alone reduces the spatial extent.

use tch::{nn, nn::Module, Tensor};

use crate::config::PolicyConfig;

/// Stack of strided convolutions reducing an image to a flat feature vector.
#[derive(Debug)]
pub struct FeatureTrunk {
    convs: Vec<nn::Conv2D>,
    feature_len: i64,
}

impl FeatureTrunk {
    /// Register the conv layers under `path` (`conv0`, `conv1`, …).
    ///
    /// `config` must already be validated; `feature_len` is taken from
    /// [`PolicyConfig::feature_len`].
    pub fn new(path: &nn::Path, config: &PolicyConfig) -> Self {
        let mut in_ch = config.num_channels as i64;
        let out_ch = config.conv_filters as i64;
        let kernel = config.conv_kernel_size as i64;

        let convs = config
            .conv_strides()
            .into_iter()
            .enumerate()
            .map(|(i, stride)| {
                let conv = nn::conv2d(
                    &(path / format!("conv{i}")),
                    in_ch,
                    out_ch,
                    kernel,
                    nn::ConvConfig { stride: stride as i64, padding: 0, ..Default::default() },
                );
                in_ch = out_ch;
                conv
            })
            .collect();

        FeatureTrunk {
            convs,
            feature_len: config.feature_len().unwrap_or(0) as i64,
        }
    }

    /// Length of the flattened output.
    pub fn feature_len(&self) -> i64 {
        self.feature_len
    }

    /// Number of conv layers.
    pub fn depth(&self) -> usize {
        self.convs.len()
    }
}

impl Module for FeatureTrunk {
    /// `images`: `[B, H, W, C]` (channels-last). Returns `[B, feature_len]`.
    fn forward(&self, images: &Tensor) -> Tensor {
        let x = images.permute([0, 3, 1, 2]);
        let x = self
            .convs
            .iter()
            .fold(x, |x, conv| conv.forward(&x).relu());
        x.flatten(1, -1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Activation range capture for int8 calibration.
//!
//! A short forward-pass loop over a handful of text samples records, for
//! every linear layer, the running per-channel maximum magnitude of its
//! input, output, and weight. The capture protocol is an explicit observer:
//! the model collaborator reports each linear evaluation through
//! [`RangeObserver::record`] instead of relying on side-effecting hook
//! registration, and [`capture_activation_ranges`] drives the loop and
//! returns the finished [`ActivationRanges`].
//!
//! Ranges only ever grow: input/output maxima fold with elementwise max
//! across samples, and the weight range is captured on first observation
//! only (weights do not change during calibration).

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor, D};
use tokenizers::Tokenizer;

/// Smallest admissible weight magnitude; keeps reciprocal scales finite.
const WEIGHT_RANGE_FLOOR: f32 = 1e-8;

/// Per-channel max-abs statistics for one linear layer.
#[derive(Debug, Clone)]
pub struct RangeEntry {
    /// Max abs of the layer input, per input channel.
    pub x: Tensor,
    /// Max abs of the layer output, per output channel.
    pub y: Tensor,
    /// Max abs of the weight, per output channel, floored at 1e-8.
    pub w: Tensor,
}

/// Finished calibration statistics, keyed by source parameter name.
#[derive(Debug, Default)]
pub struct ActivationRanges {
    ranges: HashMap<String, RangeEntry>,
}

impl ActivationRanges {
    pub fn from_entries(ranges: HashMap<String, RangeEntry>) -> Self {
        Self { ranges }
    }

    pub fn get(&self, name: &str) -> Option<&RangeEntry> {
        self.ranges.get(name)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ranges.keys().map(String::as_str)
    }
}

/// Accumulates running-max statistics while a model runs calibration
/// forwards.
#[derive(Debug, Default)]
pub struct RangeObserver {
    ranges: HashMap<String, RangeEntry>,
}

impl RangeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report one linear evaluation: `output = input @ weight.t()`.
    ///
    /// `input` and `output` may carry arbitrary leading batch/sequence axes;
    /// statistics are reduced over everything but the channel (last) axis.
    /// `weight` is `[out_channels, in_channels]`.
    pub fn record(
        &mut self,
        name: &str,
        weight: &Tensor,
        input: &Tensor,
        output: &Tensor,
    ) -> Result<()> {
        let x = channel_max_abs(input)?;
        let y = channel_max_abs(output)?;

        match self.ranges.get_mut(name) {
            Some(entry) => {
                if entry.x.dims() != x.dims() || entry.y.dims() != y.dims() {
                    candle_core::bail!(
                        "inconsistent channel widths across calibration samples for {name}"
                    );
                }
                entry.x = entry.x.maximum(&x)?;
                entry.y = entry.y.maximum(&y)?;
                // Weight range is captured on first observation only.
            }
            None => {
                let w = weight
                    .to_dtype(DType::F32)?
                    .abs()?
                    .clamp(WEIGHT_RANGE_FLOOR, f32::INFINITY)?
                    .max(1)?;
                self.ranges.insert(
                    name.to_string(),
                    RangeEntry { x, y, w },
                );
            }
        }
        Ok(())
    }

    pub fn finish(self) -> ActivationRanges {
        ActivationRanges {
            ranges: self.ranges,
        }
    }
}

/// Max abs per channel, reduced over flattened leading axes.
fn channel_max_abs(tensor: &Tensor) -> Result<Tensor> {
    let channels = tensor.dim(D::Minus1)?;
    tensor
        .reshape(((), channels))?
        .to_dtype(DType::F32)?
        .abs()?
        .max(0)
}

/// A model that can run one calibration forward pass, reporting every linear
/// layer through the observer.
pub trait CalibrationForward {
    fn forward_calibrate(&self, input_ids: &Tensor, observer: &mut RangeObserver) -> Result<()>;
}

/// A finite, restartable source of tokenized calibration samples.
///
/// Each sample is a `[1, seq_len]` tensor of token ids, truncated and
/// left-padded to exactly `seq_len`.
pub trait CalibrationSource {
    /// The sample at `index`, or `None` once the source is exhausted.
    fn sample(&self, index: usize, seq_len: usize) -> Result<Option<Tensor>>;
}

/// Run the calibration loop and return the captured ranges.
pub fn capture_activation_ranges(
    model: &dyn CalibrationForward,
    source: &dyn CalibrationSource,
    num_samples: usize,
    seq_len: usize,
) -> Result<ActivationRanges> {
    let mut observer = RangeObserver::new();
    for i in 0..num_samples {
        let Some(input_ids) = source.sample(i, seq_len)? else {
            if i == 0 {
                candle_core::bail!("calibration source produced no samples");
            }
            tracing::warn!("calibration source exhausted after {i} of {num_samples} samples");
            break;
        };
        model.forward_calibrate(&input_ids, &mut observer)?;
        tracing::debug!("calibrated sample {}/{num_samples}", i + 1);
    }
    Ok(observer.finish())
}

/// Calibration samples drawn from lines of text.
pub struct TextCalibrationSource {
    lines: Vec<String>,
    tokenizer: Tokenizer,
    pad_id: u32,
}

impl TextCalibrationSource {
    pub fn new(lines: Vec<String>, tokenizer: Tokenizer, pad_id: u32) -> Result<Self> {
        let lines: Vec<String> = lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            candle_core::bail!("calibration text contains no non-empty lines");
        }
        Ok(Self {
            lines,
            tokenizer,
            pad_id,
        })
    }

    /// One sample per non-empty line of the file.
    pub fn from_file(path: &std::path::Path, tokenizer: Tokenizer, pad_id: u32) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::new(raw.lines().map(str::to_string).collect(), tokenizer, pad_id)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl CalibrationSource for TextCalibrationSource {
    fn sample(&self, index: usize, seq_len: usize) -> Result<Option<Tensor>> {
        let Some(line) = self.lines.get(index) else {
            return Ok(None);
        };
        let encoding = self
            .tokenizer
            .encode(line.as_str(), true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenizing calibration text: {e}")))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(seq_len);

        let mut padded = vec![self.pad_id; seq_len - ids.len()];
        padded.extend_from_slice(&ids);
        Ok(Some(Tensor::from_vec(padded, (1, seq_len), &Device::Cpu)?))
    }
}

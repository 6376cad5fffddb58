//! Tensor helpers used around the sampler: batch padding, accuracy, mel cross-fade and
//! attention-mask bias.

use candle_core::{D, DType, Tensor};

use crate::error::{Result, SamplingError, invalid};

/// Label value excluded from accuracy.
pub const IGNORE_ID: i64 = -1;

/// Pad a list of `(T_i, ...)` tensors to a `(B, T_max, ...)` batch filled with `pad_value`.
///
/// All tensors must share rank (1, 2 or 3), dtype, device and trailing dimensions.
///
/// # Errors
/// `UnsupportedShape` for a rank outside 1..=3, `InvalidParameter` for an empty list or a
/// rank mismatch, and tensor errors for incompatible trailing shapes.
pub fn pad_list(xs: &[Tensor], pad_value: f64) -> Result<Tensor> {
    let first = xs
        .first()
        .ok_or_else(|| invalid("pad_list needs at least one tensor"))?;
    let rank = first.rank();
    if !(1..=3).contains(&rank) {
        return Err(SamplingError::UnsupportedShape(rank));
    }

    let mut max_len = 0;
    for x in xs {
        if x.rank() != rank {
            return Err(invalid(format!(
                "pad_list got rank {} after rank {rank}",
                x.rank()
            )));
        }
        max_len = max_len.max(x.dim(0)?);
    }

    let mut rows = Vec::with_capacity(xs.len());
    for x in xs {
        let len = x.dim(0)?;
        if len == max_len {
            rows.push(x.clone());
            continue;
        }
        let mut pad_dims = x.dims().to_vec();
        pad_dims[0] = max_len - len;
        let pad = Tensor::ones(pad_dims, x.dtype(), x.device())?.affine(0.0, pad_value)?;
        rows.push(Tensor::cat(&[x, &pad], 0)?);
    }

    Ok(Tensor::stack(&rows, 0)?)
}

/// Fraction of non-ignored positions where the argmax prediction equals the target.
///
/// `pad_outputs` is `(B * T, V)`, `pad_targets` is `(B, T)`.
///
/// # Errors
/// Tensor errors on shape mismatch, `InvalidParameter` when every target is ignored.
#[allow(clippy::cast_precision_loss)]
pub fn th_accuracy(pad_outputs: &Tensor, pad_targets: &Tensor, ignore_label: i64) -> Result<f32> {
    let (batch, max_len) = pad_targets.dims2()?;
    let (_, vocab) = pad_outputs.dims2()?;

    let preds = pad_outputs
        .reshape((batch, max_len, vocab))?
        .argmax(2)?
        .to_dtype(DType::I64)?
        .to_vec2::<i64>()?;
    let targets = pad_targets.to_dtype(DType::I64)?.to_vec2::<i64>()?;

    let mut correct = 0usize;
    let mut total = 0usize;
    for (pred_row, target_row) in preds.iter().zip(&targets) {
        for (&pred, &target) in pred_row.iter().zip(target_row) {
            if target == ignore_label {
                continue;
            }
            total += 1;
            if pred == target {
                correct += 1;
            }
        }
    }

    if total == 0 {
        return Err(invalid("every target position carries the ignore label"));
    }
    Ok(correct as f32 / total as f32)
}

/// Cross-fade the head of `fade_in_mel` with the tail of `fade_out_mel` along the last
/// dimension. The first half of `window` weights the incoming frames, the second half the
/// outgoing ones.
///
/// # Errors
/// `InvalidParameter` if either mel is shorter than the overlap, tensor errors otherwise.
pub fn fade_in_out(fade_in_mel: &Tensor, fade_out_mel: &Tensor, window: &Tensor) -> Result<Tensor> {
    let overlap = window.dim(0)? / 2;
    if overlap == 0 {
        return Ok(fade_in_mel.clone());
    }

    let in_len = fade_in_mel.dim(D::Minus1)?;
    let out_len = fade_out_mel.dim(D::Minus1)?;
    if overlap > in_len || overlap > out_len {
        return Err(invalid(format!(
            "overlap {overlap} exceeds mel lengths ({in_len}, {out_len})"
        )));
    }

    let window = window.to_dtype(fade_in_mel.dtype())?;
    let head = fade_in_mel
        .narrow(D::Minus1, 0, overlap)?
        .broadcast_mul(&window.narrow(0, 0, overlap)?)?;
    let tail = fade_out_mel
        .narrow(D::Minus1, out_len - overlap, overlap)?
        .broadcast_mul(&window.narrow(0, overlap, overlap)?)?;
    let blended = (head + tail)?;

    if overlap == in_len {
        return Ok(blended);
    }
    let rest = fade_in_mel.narrow(D::Minus1, overlap, in_len - overlap)?;
    Ok(Tensor::cat(&[&blended, &rest], D::Minus1)?)
}

/// "Same" padding for a dilated convolution.
#[must_use]
pub fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    kernel_size.saturating_sub(1) * dilation / 2
}

/// Turn a boolean (`u8`) attention mask into an additive bias: kept positions become 0,
/// masked positions the most negative value of `dtype`.
///
/// # Errors
/// `InvalidParameter` for a non-`u8` mask or a dtype other than F32/BF16/F16.
pub fn mask_to_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    if mask.dtype() != DType::U8 {
        return Err(invalid(format!(
            "mask must be u8, got {:?}",
            mask.dtype()
        )));
    }
    let min = match dtype {
        DType::F32 => f64::from(f32::MIN),
        // bf16::MIN
        DType::BF16 => -3.389_531_389_251_535_5e38,
        DType::F16 => -65504.0,
        other => return Err(invalid(format!("unsupported bias dtype {other:?}"))),
    };
    // (1 - mask) * min
    Ok(mask.to_dtype(dtype)?.affine(-min, min)?)
}

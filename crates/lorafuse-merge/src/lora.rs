//! Folding LoRA updates into base tensors.
//!
//! With `A: [r, in]`, `B: [out, r]` and scale `s = alpha / r`
//! (or `alpha / sqrt(r)` for rsLoRA):
//!
//! - Linear: `W[out, in] += s * B @ A`
//! - `fan_in_fan_out` (GPT-2 `Conv1D`): `W[in, out] += s * (B @ A)^T`
//! - Embedding: `E[vocab, dim] += s * (B @ A)^T` with `A: [r, vocab]`, `B: [dim, r]`
//! - DoRA: `V = W + s * B @ A`, then `W' = m * V / ||V||` per output row
//! - Bias: `b += s * lora_B.bias`
//!
//! All arithmetic runs in `f32`.

use lorafuse_core::{LoraFuseError, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};

use crate::adapter::{LoraKind, LoraModule};
use crate::WeightTensor;

fn view2<'a>(name: &str, tensor: &'a WeightTensor) -> Result<ArrayView2<'a, f32>> {
    let values = tensor.values().ok_or_else(|| {
        LoraFuseError::IncompatibleAdapter(format!("'{name}' is not a floating point tensor"))
    })?;
    let shape = tensor.shape();
    if shape.len() != 2 {
        return Err(LoraFuseError::IncompatibleAdapter(format!(
            "'{name}' has shape {shape:?}; expected a 2-D tensor"
        )));
    }
    ArrayView2::from_shape((shape[0], shape[1]), values)
        .map_err(|e| LoraFuseError::IncompatibleAdapter(format!("'{name}': {e}")))
}

/// `scale * B @ A` for a module.
pub fn lora_delta(module: &LoraModule) -> Result<Array2<f32>> {
    let a = view2(&format!("{}.lora_A", module.name), &module.lora_a)?;
    let b = view2(&format!("{}.lora_B", module.name), &module.lora_b)?;
    let mut delta = b.dot(&a);
    delta *= module.scale;
    Ok(delta)
}

/// Base weight shape a module's delta must be added to.
pub fn expected_weight_shape(module: &LoraModule, fan_in_fan_out: bool) -> [usize; 2] {
    let (out, inp) = module.delta_shape();
    match module.kind {
        LoraKind::Embedding => [inp, out],
        LoraKind::Linear if fan_in_fan_out => [inp, out],
        LoraKind::Linear => [out, inp],
    }
}

/// Fold a module's low-rank update into its base weight in place.
pub fn fold_weight(
    weight: &mut WeightTensor,
    module: &LoraModule,
    fan_in_fan_out: bool,
) -> Result<()> {
    let expected = expected_weight_shape(module, fan_in_fan_out);
    if weight.shape() != expected {
        return Err(LoraFuseError::ShapeMismatch {
            name: module.weight_name(),
            expected: expected.to_vec(),
            actual: weight.shape().to_vec(),
        });
    }

    let delta = lora_delta(module)?;
    let transposed = module.kind == LoraKind::Embedding || fan_in_fan_out;
    let delta = if transposed {
        delta.reversed_axes()
    } else {
        delta
    };

    let name = module.weight_name();
    let shape = (expected[0], expected[1]);
    let values = weight.values_mut().ok_or_else(|| {
        LoraFuseError::IncompatibleAdapter(format!("'{name}' is not a floating point tensor"))
    })?;
    let mut w = ArrayViewMut2::from_shape(shape, values)
        .map_err(|e| LoraFuseError::IncompatibleAdapter(format!("'{name}': {e}")))?;

    w.scaled_add(1.0, &delta);

    if let Some(magnitude) = &module.magnitude {
        let m = magnitude.values().ok_or_else(|| {
            LoraFuseError::IncompatibleAdapter(format!(
                "'{}.lora_magnitude_vector' is not a floating point tensor",
                module.name
            ))
        })?;
        // Output rows are columns of a Conv1D weight.
        let rows = if fan_in_fan_out { w.reversed_axes() } else { w };
        rescale_rows(rows, ArrayView1::from(m));
    }

    Ok(())
}

/// Scale each row of `v` to the matching magnitude. Zero rows stay zero.
fn rescale_rows(mut v: ArrayViewMut2<'_, f32>, magnitude: ArrayView1<'_, f32>) {
    for (mut row, &m) in v.axis_iter_mut(Axis(0)).zip(magnitude.iter()) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row *= m / norm;
        }
    }
}

/// Fold `scale * lora_B.bias` into the base bias.
pub fn fold_bias(bias: &mut WeightTensor, module: &LoraModule) -> Result<()> {
    let Some(lora_bias) = &module.bias else {
        return Ok(());
    };
    let (out, _) = module.delta_shape();
    if bias.num_elements() != out {
        return Err(LoraFuseError::ShapeMismatch {
            name: module.bias_name(),
            expected: vec![out],
            actual: bias.shape().to_vec(),
        });
    }

    let name = module.bias_name();
    let delta = lora_bias.values().ok_or_else(|| {
        LoraFuseError::IncompatibleAdapter(format!("'{name}' LoRA bias is not floating point"))
    })?;
    let values = bias.values_mut().ok_or_else(|| {
        LoraFuseError::IncompatibleAdapter(format!("'{name}' is not a floating point tensor"))
    })?;
    for (v, d) in values.iter_mut().zip(delta) {
        *v += module.scale * d;
    }
    Ok(())
}

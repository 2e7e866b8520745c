//! Gradient clipping by the global L2 norm over every parameter of a module.

use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn::tensor::backend::AutodiffBackend;

struct SquaredNorm<'a> {
    grads: &'a GradientsParams,
    total: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let id = param.id;
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.total += grad.powf_scalar(2.0).sum().into_scalar().elem::<f32>();
        }
    }
}

struct Rescale<'a> {
    grads: &'a mut GradientsParams,
    factor: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let id = param.id;
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register(id, grad.mul_scalar(self.factor));
        }
    }
}

/// Global gradient norm of `module`'s parameters.
pub fn grad_norm<B, M>(module: &M, grads: &GradientsParams) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm { grads, total: 0.0 };
    module.visit(&mut visitor);
    visitor.total.sqrt()
}

/// Scales all gradients of `module` by `min(1, max_norm / norm)`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm<B, M>(module: &M, grads: &mut GradientsParams, max_norm: f32) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = grad_norm::<B, M>(module, grads);
    if norm.is_finite() && norm > max_norm {
        let mut visitor = Rescale {
            grads,
            factor: max_norm / norm,
        };
        module.visit(&mut visitor);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};

    type TestBackend = Autodiff<NdArray>;

    /// Every weight and bias gradient of a 2x2 layer equals `scale`.
    fn gradients(scale: f32) -> (Linear<TestBackend>, GradientsParams) {
        let device = Default::default();
        let layer = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::ones([1, 2], &device);
        let loss = layer.forward(input).sum().mul_scalar(scale);
        let grads = GradientsParams::from_grads(loss.backward(), &layer);
        (layer, grads)
    }

    #[test]
    fn test_norm_spans_all_parameters() {
        let (layer, grads) = gradients(30.0);
        // 4 weight + 2 bias entries of 30 each
        let expected = (6.0f32 * 900.0).sqrt();
        assert!((grad_norm::<TestBackend, _>(&layer, &grads) - expected).abs() < 1e-2);
    }

    #[test]
    fn test_clipping_bounds_global_norm() {
        let (layer, mut grads) = gradients(30.0);
        // Each tensor alone is below 70, together they are above
        let before = clip_grad_norm::<TestBackend, _>(&layer, &mut grads, 70.0);
        assert!(before > 70.0);

        let after = grad_norm::<TestBackend, _>(&layer, &grads);
        assert!((after - 70.0).abs() < 1e-2);
    }

    #[test]
    fn test_small_gradients_are_untouched() {
        let (layer, mut grads) = gradients(1.0);
        let before = clip_grad_norm::<TestBackend, _>(&layer, &mut grads, 40.0);
        let after = grad_norm::<TestBackend, _>(&layer, &grads);
        assert!((before - after).abs() < 1e-6);
    }
}

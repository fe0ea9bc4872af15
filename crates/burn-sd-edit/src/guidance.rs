//! Noise prediction with classifier-free guidance

use std::marker::PhantomData;

use burn::prelude::*;
use burn_sd_edit_samplers::apply_guidance;
use burn_sd_edit_unet::{DenoisingNetwork, InterceptionPolicy, Passthrough};

use crate::diagnostics::check_tensor;
use crate::error::PipelineError;

/// Calls the denoiser and combines conditional and unconditional estimates
pub struct GuidancePredictor<'a, B: Backend, D> {
    denoiser: &'a D,
    check_nan: bool,
    _backend: PhantomData<B>,
}

impl<'a, B: Backend, D: DenoisingNetwork<B>> GuidancePredictor<'a, B, D> {
    /// With `check_nan`, every prediction is checked for NaN/Inf
    pub fn new(denoiser: &'a D, check_nan: bool) -> Self {
        Self {
            denoiser,
            check_nan,
            _backend: PhantomData,
        }
    }

    /// One network call; `policy` sees every attention layer of the pass
    pub fn predict(
        &self,
        latent: Tensor<B, 4>,
        t_emb: Tensor<B, 2>,
        context: Tensor<B, 3>,
        policy: &mut dyn InterceptionPolicy<B>,
        name: &str,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        let noise = self.denoiser.predict(latent, t_emb, context, policy)?;
        check_tensor(&noise, name, self.check_nan)?;
        Ok(noise)
    }

    /// `uncond + scale * (cond - uncond)` with plain attention
    pub fn guided_noise(
        &self,
        latent: Tensor<B, 4>,
        t_emb: Tensor<B, 2>,
        cond: Tensor<B, 3>,
        uncond: Tensor<B, 3>,
        guidance_scale: f64,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        let noise_uncond = self.predict(
            latent.clone(),
            t_emb.clone(),
            uncond,
            &mut Passthrough,
            "noise_uncond",
        )?;
        let noise_cond = self.predict(latent, t_emb, cond, &mut Passthrough, "noise_cond")?;
        Ok(apply_guidance(noise_uncond, noise_cond, guidance_scale))
    }
}

mod common;

use std::ops::ControlFlow;

use burn::prelude::*;
use burn_sd_edit::{no_progress, GenerateConfig, PipelineError, StepProgress, UsageError};
use common::{long_prompt, pipeline, pipeline_with, TestBackend, TinyFactory, CONTEXT_DIM};

fn config(seed: u64) -> GenerateConfig {
    GenerateConfig {
        num_steps: 3,
        seed: Some(seed),
        ..Default::default()
    }
}

#[test]
fn test_prompt_token_limit() {
    let pipeline = pipeline();

    // 75 words plus start and end
    let context = pipeline.encode_text(&long_prompt(75)).unwrap();
    assert_eq!(context.dims(), [1, 77, CONTEXT_DIM]);

    match pipeline.encode_text(&long_prompt(76)) {
        Err(PipelineError::Usage(UsageError::PromptTooLong { tokens, max })) => {
            assert_eq!((tokens, max), (78, 77));
        }
        other => panic!("expected PromptTooLong, got {other:?}"),
    }
}

#[test]
fn test_same_seed_same_image() {
    let pipeline = pipeline();

    let first = pipeline
        .text_to_image("a red barn in snow", &config(42), no_progress)
        .unwrap();
    let second = pipeline
        .text_to_image("a red barn in snow", &config(42), no_progress)
        .unwrap();

    assert_eq!((first.batch, first.height, first.width), (1, 128, 128));
    assert_eq!(first, second);
}

#[test]
fn test_noise_and_seed_are_exclusive() {
    let pipeline = pipeline();
    let context = pipeline.encode_text("a red barn").unwrap();
    let noise = Tensor::<TestBackend, 4>::zeros([1, 4, 16, 16], &Default::default());

    let result = pipeline.generate_image(context, Some(noise), &config(1), no_progress);
    assert!(matches!(
        result,
        Err(PipelineError::Usage(UsageError::NoiseAndSeed))
    ));
}

#[test]
fn test_given_noise_is_repeated_over_batch() {
    let pipeline = pipeline();
    let context = pipeline.encode_text("a red barn").unwrap();
    let noise = Tensor::<TestBackend, 4>::random(
        [1, 4, 16, 16],
        burn::tensor::Distribution::Normal(0.0, 1.0),
        &Default::default(),
    );
    let config = GenerateConfig {
        num_steps: 2,
        batch_size: 2,
        ..Default::default()
    };

    let images = pipeline
        .generate_image(context, Some(noise), &config, no_progress)
        .unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(images.image(0), images.image(1));
}

#[test]
fn test_wrong_noise_shape() {
    let pipeline = pipeline();
    let context = pipeline.encode_text("a red barn").unwrap();
    let noise = Tensor::<TestBackend, 4>::zeros([1, 4, 8, 8], &Default::default());
    let config = GenerateConfig {
        num_steps: 2,
        ..Default::default()
    };

    let result = pipeline.generate_image(context, Some(noise), &config, no_progress);
    assert!(matches!(
        result,
        Err(PipelineError::Usage(UsageError::ShapeMismatch { what: "noise", .. }))
    ));
}

#[test]
fn test_invalid_step_count() {
    let pipeline = pipeline();
    for steps in [0, 1000] {
        let config = GenerateConfig {
            num_steps: steps,
            ..Default::default()
        };
        let result = pipeline.text_to_image("a red barn", &config, no_progress);
        assert!(matches!(
            result,
            Err(PipelineError::Usage(UsageError::InvalidStepCount(n))) if n == steps
        ));
    }
}

#[test]
fn test_progress_and_cancellation() {
    let pipeline = pipeline();

    let mut seen = Vec::new();
    pipeline
        .text_to_image("a red barn", &config(3), |progress: StepProgress| {
            seen.push((progress.step, progress.total_steps, progress.timestep));
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(seen, vec![(0, 3, 667), (1, 3, 334), (2, 3, 1)]);

    let result = pipeline.text_to_image("a red barn", &config(3), |progress: StepProgress| {
        if progress.step == 1 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    assert!(matches!(result, Err(PipelineError::Cancelled { completed: 2 })));
}

#[test]
fn test_components_are_built_once() {
    let pipeline = pipeline();
    pipeline.text_to_image("a red barn", &config(5), no_progress).unwrap();
    // tokenizer, text encoder, denoiser, decoder
    assert_eq!(pipeline.factory().builds.get(), 4);

    pipeline.text_to_image("a blue barn", &config(6), no_progress).unwrap();
    assert_eq!(pipeline.factory().builds.get(), 4);
}

#[test]
fn test_component_failure_surfaces() {
    let pipeline = pipeline_with(TinyFactory {
        fail_decoder: true,
        ..Default::default()
    });

    let result = pipeline.text_to_image("a red barn", &config(5), no_progress);
    assert!(matches!(result, Err(PipelineError::Component(_))));
}

#[test]
fn test_negative_prompt_changes_output() {
    let pipeline = pipeline();
    let plain = pipeline.text_to_image("a red barn", &config(9), no_progress).unwrap();

    let negative = GenerateConfig {
        negative_prompt: Some("blurry".into()),
        ..config(9)
    };
    let guided = pipeline.text_to_image("a red barn", &negative, no_progress).unwrap();

    assert_ne!(plain, guided);
}

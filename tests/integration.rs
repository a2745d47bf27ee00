// tests/integration.rs - End-to-end integration runs on the host reference device
// Tree location: ./tests/integration.rs

use std::path::Path;
use std::sync::Arc;

use approx::assert_relative_eq;
use xrpd1d::gpu::{HostDevice, LaunchRecord};
use xrpd1d::integrator::{work_size, Capability, Correction, BLOCK_SIZE};
use xrpd1d::{status, ContextOwnership, Integrator, IntegrationConfig, Settings, Stage, Toggle};

fn configured(device: &Arc<HostDevice>, image_size: i64, bins: i64, fp64: bool) -> Integrator<HostDevice> {
    let _ = xrpd1d::init();
    let mut integrator = Integrator::new(Arc::clone(device), ContextOwnership::Owned, Settings::default());
    integrator
        .get_configuration(IntegrationConfig::new(16, image_size, bins, fp64).unwrap())
        .unwrap();
    integrator.configure(None).unwrap();
    integrator
}

/// Pixel centres evenly spread over `[0, 10)` for 256 pixels
fn ramp() -> Vec<f32> {
    (0..256).map(|i| (i as f32 + 0.5) * (10.0 / 256.0)).collect()
}

fn run(integrator: &mut Integrator<HostDevice>, image: &[f32], bins: usize) -> (Vec<f32>, Vec<f32>) {
    let mut histogram = vec![0.0; bins];
    let mut weights = vec![0.0; bins];
    integrator.execute(image, &mut histogram, &mut weights).unwrap();
    (histogram, weights)
}

fn names(launches: &[LaunchRecord]) -> Vec<&str> {
    launches.iter().map(|l| l.kernel.as_str()).collect()
}

#[test]
fn test_configure_rejects_nonpositive_sizes() {
    assert_eq!(status::of(&IntegrationConfig::new(16, 0, 10, false)), status::PRECONDITION);
    assert_eq!(status::of(&IntegrationConfig::new(16, 256, -3, false)), status::PRECONDITION);

    let device = Arc::new(HostDevice::new());
    let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
    let config = IntegrationConfig { image_stride: 16, image_size: 256, bin_count: 0, use_double_precision: false };
    assert_eq!(status::of(&integrator.get_configuration(config)), status::PRECONDITION);
    assert_eq!(integrator.stage(), Stage::ContextActive);
}

#[test]
fn test_image_smaller_than_work_group_fails_configure() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
    integrator
        .get_configuration(IntegrationConfig::new(8, (BLOCK_SIZE - 1) as i64, 10, false).unwrap())
        .unwrap();

    assert_eq!(status::of(&integrator.configure(None)), status::PRECONDITION);
    assert_eq!(integrator.stage(), Stage::ContextActive);
    assert!(integrator.capabilities().is_empty());
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_queues(), 0);
}

#[test]
fn test_execute_before_load_tth_is_rejected() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    let transfers = device.transfer_count();

    let mut histogram = vec![0.0; 10];
    let mut weights = vec![0.0; 10];
    let result = integrator.execute(&[1.0; 256], &mut histogram, &mut weights);

    assert_eq!(status::of(&result), status::PRECONDITION);
    assert_eq!(device.transfer_count(), transfers);
    assert_eq!(integrator.exec_count(), 0);
}

#[test]
fn test_flat_image_single_bin() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();

    let (histogram, weights) = run(&mut integrator, &[3.0; 256], 10);

    assert_relative_eq!(weights[0], 256.0);
    assert_relative_eq!(histogram[0], 768.0);
    assert!(weights[1..].iter().all(|w| *w == 0.0));
    assert_eq!(integrator.exec_count(), 1);
    assert_eq!(device.live_events(), 0);
}

#[test]
fn test_linear_ramp_fills_every_bin() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 10_000, 100, true);
    let tth: Vec<f32> = (0..10_000).map(|i| i as f32 * 0.01).collect();
    integrator.load_tth(&tth, &vec![0.0; 10_000], 0.0, 100.0).unwrap();

    let (histogram, weights) = run(&mut integrator, &vec![1.0; 10_000], 100);

    assert!(weights.iter().all(|w| *w > 0.0));
    assert_relative_eq!(weights.iter().sum::<f32>(), 10_000.0, max_relative = 1e-5);
    assert_relative_eq!(histogram.iter().sum::<f32>(), 10_000.0, max_relative = 1e-5);
}

#[test]
fn test_wide_pixels_split_between_bins() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, true);
    integrator.load_tth(&[1.0; 256], &[0.5; 256], 0.0, 10.0).unwrap();

    let (histogram, weights) = run(&mut integrator, &[2.0; 256], 10);

    assert_relative_eq!(weights[0], 128.0, max_relative = 1e-6);
    assert_relative_eq!(weights[1], 128.0, max_relative = 1e-6);
    assert_relative_eq!(histogram[0] + histogram[1], 512.0, max_relative = 1e-6);
}

#[test]
fn test_launch_order_and_work_sizes() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 300, 10, false);
    assert_eq!(names(&device.launches()), vec!["imemset"]);

    device.clear_launches();
    let tth: Vec<f32> = (0..300).map(|i| i as f32 / 30.0).collect();
    integrator.load_tth(&tth, &vec![0.01; 300], 0.0, 10.0).unwrap();
    assert_eq!(names(&device.launches()), vec!["get_spans", "group_spans"]);

    device.clear_launches();
    run(&mut integrator, &vec![1.0; 300], 10);
    let launches = device.launches();
    assert_eq!(names(&launches), vec!["uimemset2", "create_histo_binarray", "ui2f2"]);
    assert_eq!(launches[0].global, work_size(10));
    assert_eq!(launches[1].global, work_size(300));
    assert!(launches.iter().all(|l| l.local == BLOCK_SIZE && l.global % BLOCK_SIZE == 0));

    device.clear_launches();
    integrator.set_dummy_value(-5.0, 0.1).unwrap();
    integrator.set_solid_angle(&vec![1.0; 300]).unwrap();
    run(&mut integrator, &vec![1.0; 300], 10);
    assert_eq!(
        names(&device.launches()),
        vec!["uimemset2", "dummyval_correction", "solidangle_correction", "create_histo_binarray", "ui2f2"]
    );

    let profile = integrator.last_profile().unwrap();
    assert!(profile.dummy_ns.is_some());
    assert!(profile.correction_ns.is_some());
}

#[test]
fn test_corrections_are_independent() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();
    let image = [10.0f32; 256];

    integrator.set_dark(&[2.0; 256]).unwrap();
    let (histogram, _) = run(&mut integrator, &image, 10);
    assert_relative_eq!(histogram[0], 256.0 * 8.0);

    integrator.set_flat(&[2.0; 256]).unwrap();
    assert!(!integrator.corrections().is_enabled(Correction::SolidAngle));
    assert!(!integrator.corrections().is_enabled(Correction::Polarization));
    let (histogram, _) = run(&mut integrator, &image, 10);
    assert_relative_eq!(histogram[0], 256.0 * 4.0);

    assert_eq!(integrator.unset_dark().unwrap(), Toggle::Cleared);
    let (histogram, _) = run(&mut integrator, &image, 10);
    assert_relative_eq!(histogram[0], 256.0 * 5.0);

    integrator.set_polarization(&[0.5; 256]).unwrap();
    let (histogram, _) = run(&mut integrator, &image, 10);
    assert_relative_eq!(histogram[0], 256.0 * 10.0);

    assert_eq!(status::of_toggle(&integrator.unset_solid_angle()), status::NOOP);
}

#[test]
fn test_mask_set_twice_then_unset_twice() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();

    let mut mask = vec![0; 256];
    mask[..56].iter_mut().for_each(|m| *m = 1);
    integrator.set_mask(&mask).unwrap();
    integrator.set_mask(&mask).unwrap();
    let (_, weights) = run(&mut integrator, &[1.0; 256], 10);
    assert_relative_eq!(weights[0], 200.0);

    assert_eq!(status::of_toggle(&integrator.unset_mask()), status::SUCCESS);
    assert_eq!(device.buffer_i32("mask").unwrap(), vec![0; 256]);
    assert_eq!(status::of_toggle(&integrator.unset_mask()), status::NOOP);

    let (_, weights) = run(&mut integrator, &[1.0; 256], 10);
    assert_relative_eq!(weights[0], 256.0);
}

#[test]
fn test_dummy_pixels_are_skipped() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, true);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();

    let mut image = vec![4.0f32; 256];
    image[..16].iter_mut().for_each(|v| *v = -1.0);

    integrator.set_dummy_value(-1.0, 0.25).unwrap();
    let (histogram, weights) = run(&mut integrator, &image, 10);
    assert_relative_eq!(weights[0], 240.0);
    assert_relative_eq!(histogram[0], 960.0);

    assert_eq!(integrator.unset_dummy_value().unwrap(), Toggle::Cleared);
    assert_eq!(integrator.unset_dummy_value().unwrap(), Toggle::AlreadyClear);
    let (_, weights) = run(&mut integrator, &image, 10);
    assert_relative_eq!(weights[0], 256.0);

    assert_eq!(status::of(&integrator.set_dummy_value(0.0, -1.0)), status::PRECONDITION);
}

#[test]
fn test_restricted_range_rebinds_active_range() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, true);
    integrator.load_tth(&ramp(), &[0.0; 256], 0.0, 10.0).unwrap();

    let (_, weights) = run(&mut integrator, &[1.0; 256], 10);
    assert_relative_eq!(weights.iter().sum::<f32>(), 256.0);

    integrator.set_range(0.0, 5.0).unwrap();
    let (_, weights) = run(&mut integrator, &[1.0; 256], 10);
    assert_relative_eq!(weights.iter().sum::<f32>(), 128.0);
    assert!(weights.iter().all(|w| *w > 0.0));

    assert_eq!(integrator.unset_range().unwrap(), Toggle::Cleared);
    assert_eq!(integrator.unset_range().unwrap(), Toggle::AlreadyClear);
    let (_, weights) = run(&mut integrator, &[1.0; 256], 10);
    assert_relative_eq!(weights.iter().sum::<f32>(), 256.0);
}

#[test]
fn test_reconfigure_replaces_buffers() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();
    integrator.set_mask(&[0; 256]).unwrap();

    integrator
        .get_configuration(IntegrationConfig::new(16, 256, 20, false).unwrap())
        .unwrap();
    integrator.configure(None).unwrap();

    assert_eq!(integrator.stage(), Stage::Configured);
    assert_eq!(device.live_buffers(), 17);
    assert_eq!(device.live_kernels(), 8);
    assert_eq!(device.live_programs(), 1);
    assert_eq!(device.live_queues(), 1);
    assert!(!integrator.corrections().is_enabled(Correction::Mask));
    assert_eq!(device.buffer_f32("histogram").map(|h| h.len()), Some(20));
}

#[test]
fn test_allocation_failure_rolls_back() {
    let device = Arc::new(HostDevice::builder().fail_buffer("dark").build());
    let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
    integrator
        .get_configuration(IntegrationConfig::new(16, 256, 10, false).unwrap())
        .unwrap();

    assert_eq!(status::of(&integrator.configure(None)), status::FATAL);
    assert_eq!(integrator.stage(), Stage::ContextActive);
    assert_eq!(integrator.parameters(), None);
    assert!(integrator.capabilities().is_empty());
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_queues(), 0);

    // parameters must be supplied again
    assert_eq!(status::of(&integrator.configure(None)), status::PRECONDITION);
}

#[test]
fn test_kernel_creation_failure_rolls_back() {
    let device = Arc::new(HostDevice::builder().fail_kernel("ui2f2").build());
    let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
    integrator
        .get_configuration(IntegrationConfig::new(16, 256, 10, true).unwrap())
        .unwrap();

    assert_eq!(status::of(&integrator.configure(None)), status::FATAL);
    assert_eq!(device.live_kernels(), 0);
    assert_eq!(device.live_programs(), 0);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_queues(), 0);
}

#[test]
fn test_missing_kernel_source_fails_configure() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
    integrator
        .get_configuration(IntegrationConfig::new(16, 256, 10, false).unwrap())
        .unwrap();

    let result = integrator.configure(Some(Path::new("/nonexistent/xrpd1d.cl")));
    assert_eq!(status::of(&result), status::FATAL);
    assert_eq!(device.live_buffers(), 0);
    assert!(!integrator.capabilities().contains(Capability::Queue));
}

#[test]
fn test_memory_budget_is_enforced() {
    let device = Arc::new(HostDevice::builder().global_memory(4096).build());
    let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, Settings::default());
    integrator
        .get_configuration(IntegrationConfig::new(16, 256, 10, false).unwrap())
        .unwrap();

    assert_eq!(status::of(&integrator.configure(None)), status::FATAL);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_failed_launch_releases_events() {
    let device = Arc::new(HostDevice::builder().fail_launch("create_histo_binarray").build());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();

    let mut histogram = vec![0.0; 10];
    let mut weights = vec![0.0; 10];
    let result = integrator.execute(&[1.0; 256], &mut histogram, &mut weights);

    assert_eq!(status::of(&result), status::FATAL);
    assert_eq!(device.live_events(), 0);
    assert_eq!(integrator.exec_count(), 0);
}

#[test]
fn test_wrong_output_length_touches_nothing() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();
    let transfers = device.transfer_count();

    let mut histogram = vec![0.0; 9];
    let mut weights = vec![0.0; 10];
    let result = integrator.execute(&[1.0; 256], &mut histogram, &mut weights);

    assert_eq!(status::of(&result), status::PRECONDITION);
    assert_eq!(device.transfer_count(), transfers);
}

#[test]
fn test_timings_accumulate_and_reset() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();
    integrator.reset_time();

    run(&mut integrator, &[1.0; 256], 10);
    run(&mut integrator, &[1.0; 256], 10);

    let profile = *integrator.last_profile().unwrap();
    assert_eq!(integrator.exec_count(), 2);
    assert_eq!(integrator.timings().exec_ns(), 2 * profile.exec_ns());
    assert_eq!(integrator.timings().transfer_ns(), 2 * profile.transfer_ns());
    assert!(integrator.exec_time_ms() > 0.0);
    assert!(integrator.transfer_time_ms() > 0.0);

    integrator.reset_time();
    assert_eq!(integrator.exec_count(), 0);
    assert_eq!(integrator.exec_time_ms(), 0.0);
}

#[test]
fn test_clean_is_idempotent() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();

    integrator.clean(true).unwrap();
    integrator.clean(true).unwrap();
    assert_eq!(integrator.stage(), Stage::ParametersSet);
    assert!(integrator.capabilities().is_empty());
    assert_eq!(device.live_buffers(), 0);
    assert!(!device.is_torn_down());

    // same parameters, configure again without get_configuration
    integrator.configure(None).unwrap();
    assert_eq!(integrator.stage(), Stage::Configured);

    integrator.clean(false).unwrap();
    integrator.clean(false).unwrap();
    assert_eq!(integrator.stage(), Stage::NoContext);
    assert!(device.is_torn_down());
    assert_eq!(status::of(&integrator.configure(None)), status::PRECONDITION);
}

#[test]
fn test_settings_preserve_context_on_drop() {
    let device = Arc::new(HostDevice::new());
    let settings = Settings { preserve_context_on_drop: true, ..Settings::default() };
    {
        let mut integrator = Integrator::new(Arc::clone(&device), ContextOwnership::Owned, settings);
        integrator
            .get_configuration(IntegrationConfig::new(16, 256, 10, false).unwrap())
            .unwrap();
        integrator.configure(None).unwrap();
    }
    assert_eq!(device.live_buffers(), 0);
    assert!(!device.is_torn_down());
}

#[test]
fn test_failed_load_tth_blocks_execute() {
    let device = Arc::new(HostDevice::builder().fail_launch_after("group_spans", 1).build());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();
    assert_eq!(integrator.stage(), Stage::TthLoaded);

    // uploads land, then the span grouping fails
    let result = integrator.load_tth(&[9.5; 256], &[0.0; 256], 0.0, 10.0);
    assert_eq!(status::of(&result), status::FATAL);
    assert_eq!(integrator.stage(), Stage::Configured);
    assert_eq!(device.live_events(), 0);

    let mut histogram = vec![0.0; 10];
    let mut weights = vec![0.0; 10];
    let result = integrator.execute(&[1.0; 256], &mut histogram, &mut weights);
    assert_eq!(status::of(&result), status::PRECONDITION);
    assert!(weights.iter().all(|w| *w == 0.0));
    assert_eq!(integrator.exec_count(), 0);
}

#[test]
fn test_rejected_load_tth_keeps_previous_arrays() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();

    let result = integrator.load_tth(&[0.5; 255], &[0.0; 256], 0.0, 10.0);
    assert_eq!(status::of(&result), status::PRECONDITION);
    assert_eq!(integrator.stage(), Stage::TthLoaded);

    let (_, weights) = run(&mut integrator, &[1.0; 256], 10);
    assert_relative_eq!(weights[0], 256.0);
}

#[test]
fn test_half_width_beyond_range_is_clipped() {
    let device = Arc::new(HostDevice::new());
    let mut integrator = configured(&device, 256, 10, true);

    // each pixel covers [-5, 15]: half of it falls inside the range
    integrator.load_tth(&[5.0; 256], &[10.0; 256], 0.0, 10.0).unwrap();
    let (histogram, weights) = run(&mut integrator, &[2.0; 256], 10);
    for bin in 0..10 {
        assert_relative_eq!(weights[bin], 12.8, max_relative = 1e-6);
        assert_relative_eq!(histogram[bin], 25.6, max_relative = 1e-6);
    }

    integrator.load_tth(&[5.0; 256], &[1.0e30; 256], 0.0, 10.0).unwrap();
    let (histogram, weights) = run(&mut integrator, &[2.0; 256], 10);
    assert!(weights.iter().all(|w| w.is_finite() && *w >= 0.0 && *w <= 256.0));
    assert!(histogram.iter().all(|h| h.is_finite()));
}

#[test]
fn test_failed_kernel_release_does_not_stop_clean() {
    let device = Arc::new(HostDevice::builder().fail_release("get_spans").build());
    let mut integrator = configured(&device, 256, 10, false);
    assert_eq!(device.live_kernels(), 8);

    integrator.clean(true).unwrap();

    assert_eq!(integrator.stage(), Stage::ParametersSet);
    assert!(integrator.capabilities().is_empty());
    assert_eq!(device.live_kernels(), 1);
    assert_eq!(device.live_programs(), 0);
    assert_eq!(device.live_queues(), 0);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_launch_log_keeps_newest_records() {
    let device = Arc::new(HostDevice::builder().launch_log(2).build());
    let mut integrator = configured(&device, 256, 10, false);
    integrator.load_tth(&[0.5; 256], &[0.0; 256], 0.0, 10.0).unwrap();
    assert_eq!(names(&device.launches()), vec!["get_spans", "group_spans"]);

    run(&mut integrator, &[1.0; 256], 10);
    assert_eq!(names(&device.launches()), vec!["create_histo_binarray", "ui2f2"]);
}

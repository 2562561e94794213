#![forbid(unsafe_code)]

use rfs_device::{CancelToken, DeviceFile, FileRole};
use rfs_error::RfsError;
use rfs_exec::Executor;
use rfs_persist::load_progress;
use rfs_plan::{plan, MovePlan, PlanRequest};
use rfs_storage::{StorageWindow, SCRATCH_FILE_NAME};
use rfs_types::{BlockBits, Extent, ExtentList};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const PAGE: u64 = 4096;

/// A temp device image whose every page is filled with its own index.
fn make_device(dir: &Path, pages: u64) -> DeviceFile {
    let path = dir.join("device.img");
    let mut file = File::create(&path).unwrap();
    for page in 0..pages {
        file.write_all(&vec![page as u8; PAGE as usize]).unwrap();
    }
    file.sync_all().unwrap();
    drop(file);
    DeviceFile::open(&path, FileRole::Device).unwrap()
}

fn page_of(device: &DeviceFile, page: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; PAGE as usize];
    device.read_at(page * PAGE, &mut buf).unwrap();
    buf
}

fn swap_plan(pages_free: u64, requested_storage: u64) -> (ExtentList, ExtentList, MovePlan) {
    let loop_extents = ExtentList::from_unsorted(vec![
        Extent::new(0, PAGE, PAGE),
        Extent::new(PAGE, 0, PAGE),
    ]);
    let free_extents =
        ExtentList::from_unsorted(vec![Extent::new(2 * PAGE, 2 * PAGE, pages_free * PAGE)]);
    let device_length = (2 + pages_free) * PAGE;
    let request = PlanRequest {
        loop_extents: &loop_extents,
        free_extents: &free_extents,
        device_length,
        block_bits: BlockBits::new(12).unwrap(),
        requested_storage,
        storage_alignment: PAGE,
        fixed_storage: None,
    };
    let plan = plan(&request).unwrap();
    (loop_extents, free_extents, plan)
}

#[test]
fn swap_through_primary_storage_relocates_both_pages() {
    let dir = tempfile::tempdir().unwrap();
    let device = make_device(dir.path(), 16);
    let (_, _, plan) = swap_plan(14, PAGE);
    assert_eq!(plan.steps.len(), 3);
    assert_eq!(plan.secondary_len, 0);

    let mut window =
        StorageWindow::build(&device, dir.path(), &plan.primary_storage, plan.secondary_len)
            .unwrap();
    let mut exec = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        CancelToken::new(),
        0,
    )
    .unwrap();
    exec.run().unwrap();
    drop(exec);
    window.teardown(true).unwrap();

    // Page 0 now holds the loop file's logical page 0 (originally at
    // physical page 1) and vice versa.
    assert!(page_of(&device, 0).iter().all(|&b| b == 1));
    assert!(page_of(&device, 1).iter().all(|&b| b == 0));
    // Untouched tail pages keep their fill (staging page 2 was restored
    // from the loop data it parked, not zeroed, so skip it).
    assert!(page_of(&device, 5).iter().all(|&b| b == 5));

    let progress = load_progress(dir.path()).unwrap().unwrap();
    assert!(progress.is_done());
    assert_eq!(progress.total_steps, 3);
}

#[test]
fn swap_spills_into_scratch_file() {
    let dir = tempfile::tempdir().unwrap();
    // Two-page extents, one free page: primary covers half the staging,
    // the scratch file the other half.
    let loop_extents = ExtentList::from_unsorted(vec![
        Extent::new(0, 2 * PAGE, 2 * PAGE),
        Extent::new(2 * PAGE, 0, 2 * PAGE),
    ]);
    let free_extents =
        ExtentList::from_unsorted(vec![Extent::new(4 * PAGE, 4 * PAGE, PAGE)]);
    let request = PlanRequest {
        loop_extents: &loop_extents,
        free_extents: &free_extents,
        device_length: 5 * PAGE,
        block_bits: BlockBits::new(12).unwrap(),
        requested_storage: 2 * PAGE,
        storage_alignment: PAGE,
        fixed_storage: None,
    };
    let plan = plan(&request).unwrap();
    assert_eq!(plan.primary_storage.total_length(), PAGE);
    assert_eq!(plan.secondary_len, PAGE);

    let device = make_device(dir.path(), 5);
    let mut window =
        StorageWindow::build(&device, dir.path(), &plan.primary_storage, plan.secondary_len)
            .unwrap();
    let mut exec = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        CancelToken::new(),
        0,
    )
    .unwrap();
    exec.run().unwrap();
    drop(exec);
    window.teardown(true).unwrap();

    assert!(page_of(&device, 0).iter().all(|&b| b == 2));
    assert!(page_of(&device, 1).iter().all(|&b| b == 3));
    assert!(page_of(&device, 2).iter().all(|&b| b == 0));
    assert!(page_of(&device, 3).iter().all(|&b| b == 1));
    assert!(!dir.path().join(SCRATCH_FILE_NAME).exists());
}

#[test]
fn interrupted_run_resumes_from_the_progress_marker() {
    let dir = tempfile::tempdir().unwrap();
    let device = make_device(dir.path(), 16);
    let (_, _, plan) = swap_plan(14, PAGE);

    // First run: one step, then "crash" (drop without teardown).
    {
        let mut window = StorageWindow::build(
            &device,
            dir.path(),
            &plan.primary_storage,
            plan.secondary_len,
        )
        .unwrap();
        let mut exec = Executor::new(
            &device,
            &mut window,
            &plan,
            dir.path().to_path_buf(),
            CancelToken::new(),
            0,
        )
        .unwrap();
        assert!(exec.step().unwrap());
    }

    let progress = load_progress(dir.path()).unwrap().unwrap();
    assert_eq!(progress.completed_steps, 1);
    assert!(!progress.is_done());

    // Second run: rebuild the window over the same storage split and
    // execute exactly the remaining steps.
    let mut window = StorageWindow::build(
        &device,
        dir.path(),
        &plan.primary_storage,
        plan.secondary_len,
    )
    .unwrap();
    let mut exec = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        CancelToken::new(),
        progress.completed_steps,
    )
    .unwrap();
    assert_eq!(exec.remaining(), 2);
    exec.run().unwrap();
    drop(exec);
    window.teardown(true).unwrap();

    assert!(page_of(&device, 0).iter().all(|&b| b == 1));
    assert!(page_of(&device, 1).iter().all(|&b| b == 0));
}

#[test]
fn completed_job_replays_as_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let device = make_device(dir.path(), 16);
    let (_, _, plan) = swap_plan(14, PAGE);

    let mut window = StorageWindow::build(
        &device,
        dir.path(),
        &plan.primary_storage,
        plan.secondary_len,
    )
    .unwrap();
    let mut exec = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        CancelToken::new(),
        0,
    )
    .unwrap();
    exec.run().unwrap();
    drop(exec);

    let snapshot: Vec<Vec<u8>> = (0..16).map(|p| page_of(&device, p)).collect();

    // Re-run from the persisted marker: zero steps, device untouched.
    let progress = load_progress(dir.path()).unwrap().unwrap();
    let mut exec = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        CancelToken::new(),
        progress.completed_steps,
    )
    .unwrap();
    assert_eq!(exec.remaining(), 0);
    exec.run().unwrap();
    drop(exec);
    window.teardown(true).unwrap();

    for (page, expected) in snapshot.iter().enumerate() {
        assert_eq!(&page_of(&device, page as u64), expected, "page {page}");
    }
}

#[test]
fn cancellation_halts_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let device = make_device(dir.path(), 16);
    let (_, _, plan) = swap_plan(14, PAGE);

    let mut window = StorageWindow::build(
        &device,
        dir.path(),
        &plan.primary_storage,
        plan.secondary_len,
    )
    .unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut exec = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        cancel,
        0,
    )
    .unwrap();
    let err = exec.run().unwrap_err();
    assert!(matches!(err, RfsError::Cancelled), "got {err}");
    drop(exec);
    window.teardown(false).unwrap();

    // Nothing executed, nothing persisted.
    assert_eq!(load_progress(dir.path()).unwrap(), None);
    assert!(page_of(&device, 0).iter().all(|&b| b == 0));
}

#[test]
fn stale_progress_marker_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let device = make_device(dir.path(), 16);
    let (_, _, plan) = swap_plan(14, PAGE);
    let mut window = StorageWindow::build(
        &device,
        dir.path(),
        &plan.primary_storage,
        plan.secondary_len,
    )
    .unwrap();
    let err = Executor::new(
        &device,
        &mut window,
        &plan,
        dir.path().to_path_buf(),
        CancelToken::new(),
        7,
    )
    .unwrap_err();
    assert!(matches!(err, RfsError::Format(_)), "got {err}");
}

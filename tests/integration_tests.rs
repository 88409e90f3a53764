//! Integration tests for guardalloc.

use std::sync::Arc;

use parking_lot::Mutex;

use guardalloc::{
    AllocConfig, ClassId, ErrorCode, GuardAlloc, Mode, StatScope, Verdict, UNKNOWN_CAP,
};

fn quiet() -> GuardAlloc {
    GuardAlloc::new(AllocConfig::default())
}

/// An allocator whose error hook records the report instead of
/// stopping, so damage scenarios can assert on the details.
fn recording() -> (GuardAlloc, Arc<Mutex<Vec<(ErrorCode, isize)>>>) {
    let alloc = quiet();
    let seen: Arc<Mutex<Vec<(ErrorCode, isize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    alloc.set_error_hook(Some(Arc::new(move |report| {
        sink.lock().push((report.code, report.offset));
        Verdict::Continue
    })));
    (alloc, seen)
}

#[test]
fn test_alloc_write_free_lifecycle() {
    let alloc = quiet();

    let ptr = alloc.alloc(ClassId::DEFAULT, "lifecycle", 256).unwrap();
    assert!(!ptr.is_null());

    // Write every byte to verify the memory is usable.
    unsafe {
        for i in 0..256 {
            *ptr.add(i) = i as u8;
        }
    }
    assert_eq!(alloc.check_block(Some(ptr as *const u8)), Ok(()));
    assert_eq!(alloc.block_size(ptr), Ok(256));

    alloc.free(ptr).unwrap();
    assert_eq!(alloc.close(), Ok(()));
}

#[test]
fn test_postfix_overwrite_detected_with_offset() {
    let (alloc, seen) = recording();
    let ptr = alloc.alloc(ClassId::DEFAULT, "victim", 16).unwrap();

    // Write one byte past the user area, into the postfix tag.
    unsafe { *ptr.add(16 + 2) = 0x5A };

    assert_eq!(
        alloc.check_block(Some(ptr as *const u8)),
        Err(ErrorCode::BlockDamage)
    );
    let reports = seen.lock();
    assert_eq!(reports.len(), 1);
    // Damage offset equals the user length: first byte past the data.
    assert_eq!(reports[0], (ErrorCode::BlockDamage, 16));
}

#[test]
fn test_prefix_overwrite_detected_before_user_data() {
    let (alloc, seen) = recording();
    let ptr = alloc.alloc(ClassId::DEFAULT, "victim", 32).unwrap();

    unsafe { *ptr.sub(3) = 0 };

    assert_eq!(
        alloc.check_block(Some(ptr as *const u8)),
        Err(ErrorCode::BlockDamage)
    );
    assert_eq!(seen.lock()[0], (ErrorCode::BlockDamage, -8));
}

#[test]
fn test_damaged_block_survives_failed_free() {
    let (alloc, _seen) = recording();
    let ptr = alloc.alloc(ClassId::DEFAULT, "victim", 16).unwrap();
    unsafe { *ptr.add(16) = 0 };

    // The free is refused; the block stays in the records.
    assert_eq!(alloc.free(ptr), Err(ErrorCode::BlockDamage));
    assert_eq!(alloc.total_memory(StatScope::Current).blocks, 1);
}

#[test]
fn test_double_free_reports_released() {
    let alloc = quiet();
    let ptr = alloc.alloc(ClassId::DEFAULT, "once", 64).unwrap();
    alloc.free(ptr).unwrap();

    // Advisory by default: an error, never a crash.
    assert_eq!(alloc.free(ptr), Err(ErrorCode::Released));
    assert_eq!(alloc.error_code(), Some(ErrorCode::Released));
}

#[test]
fn test_wild_pointer_reports_not_found() {
    let alloc = quiet();
    let local = 99u64;
    assert_eq!(
        alloc.check_block(Some(&local as *const u64 as *const u8)),
        Err(ErrorCode::NotFound)
    );
}

#[test]
fn test_no_check_class_skips_verification() {
    let alloc = quiet();
    let ptr = alloc.alloc(ClassId::NO_CHECK, "", 128).unwrap();

    assert_eq!(
        alloc.check_block(Some(ptr as *const u8)),
        Err(ErrorCode::NoCheckClass)
    );
    // The whole-heap sweep still passes with no-check blocks present.
    assert_eq!(alloc.check_block(None), Ok(()));

    alloc.free(ptr).unwrap();
    assert_eq!(alloc.close(), Ok(()));
}

#[test]
fn test_locked_buffer_detects_mutation() {
    let (alloc, _seen) = recording();
    let mut buf = vec![0u8; 100];

    unsafe {
        alloc.lock_buffer(buf.as_ptr(), buf.len()).unwrap();
        assert_eq!(alloc.check_locked(Some(buf.as_ptr())), Ok(()));

        buf[50] = 1;
        assert_eq!(
            alloc.check_locked(Some(buf.as_ptr())),
            Err(ErrorCode::BufferDamage)
        );

        // Release reports the damage once and removes the entry.
        assert_eq!(
            alloc.release_buffer(Some(buf.as_ptr())),
            Err(ErrorCode::BufferDamage)
        );
        assert_eq!(
            alloc.release_buffer(Some(buf.as_ptr())),
            Err(ErrorCode::NotFound)
        );
    }
}

#[test]
fn test_lock_buffer_rejects_null_and_zero_length() {
    let alloc = quiet();
    let buf = [0u8; 16];
    unsafe {
        assert_eq!(
            alloc.lock_buffer(std::ptr::null(), 16),
            Err(ErrorCode::NullPointer)
        );
        assert_eq!(alloc.error_code(), Some(ErrorCode::NullPointer));

        assert_eq!(alloc.lock_buffer(buf.as_ptr(), 0), Err(ErrorCode::BadSize));
        assert_eq!(alloc.error_code(), Some(ErrorCode::BadSize));
    }
    assert_eq!(alloc.close(), Ok(()));
}

#[test]
fn test_close_refuses_outstanding_locked_buffer() {
    let alloc = quiet();
    let buf = [0u8; 32];
    unsafe {
        alloc.lock_buffer(buf.as_ptr(), buf.len()).unwrap();
        assert_eq!(alloc.close(), Err(ErrorCode::NotEmpty));
        alloc.release_buffer(None).unwrap();
    }
    assert_eq!(alloc.close(), Ok(()));
}

#[test]
fn test_mode_stack_balanced_and_overflow() {
    let base = Mode::WARNING;
    let alloc = GuardAlloc::new(
        AllocConfig::default()
            .with_mode(base)
            .with_mode_stack_depth(3),
    );

    alloc.open_mode(Mode::DEBUG).unwrap();
    alloc.open_mode(Mode::DEBUG | Mode::TRACE).unwrap();
    alloc.open_mode(Mode::MODIFY).unwrap();
    assert_eq!(alloc.current_mode(), Mode::MODIFY);

    // Fourth open overflows: the mode applies, the save is lost.
    assert_eq!(alloc.open_mode(Mode::CONTINUE), Err(ErrorCode::Warn));
    assert_eq!(alloc.current_mode(), Mode::CONTINUE);

    // One pop after an overflow restores the base mode.
    alloc.close_mode().unwrap();
    assert_eq!(alloc.current_mode(), base);
    assert_eq!(alloc.close_mode(), Err(ErrorCode::Warn));
}

#[test]
fn test_modify_mode_stamps_patterns() {
    let alloc = GuardAlloc::new(AllocConfig::default().with_mode(Mode::MODIFY));
    let ptr = alloc.alloc(ClassId::DEFAULT, "stamped", 64).unwrap();

    let bytes = unsafe { std::slice::from_raw_parts(ptr, 64) };
    assert!(bytes.iter().all(|&b| b == guardalloc::UNINIT_PATTERN));

    alloc.free(ptr).unwrap();
}

#[test]
fn test_class_lifecycle_and_accounting() {
    let alloc = quiet();
    let meshes = alloc.create_class("meshes").unwrap();
    let audio = alloc.create_class("audio").unwrap();

    let m1 = alloc.alloc(meshes, "cube", 100).unwrap();
    let m2 = alloc.alloc(meshes, "sphere", 200).unwrap();
    let a1 = alloc.alloc(audio, "click", 50).unwrap();

    let mesh_use = alloc.class_memory(meshes, StatScope::Current).unwrap();
    assert_eq!(mesh_use.blocks, 2);
    assert_eq!(mesh_use.user_bytes, 300);

    // Per-class block counts sum to the heap total.
    let total: usize = alloc
        .classes()
        .iter()
        .map(|&id| alloc.class_memory(id, StatScope::Current).unwrap().blocks)
        .sum();
    assert_eq!(total, alloc.total_memory(StatScope::Current).blocks);

    assert_eq!(alloc.close_class(meshes), Err(ErrorCode::ClassNotReleased));
    alloc.free(m1).unwrap();
    alloc.free(m2).unwrap();
    assert_eq!(alloc.close_class(meshes), Ok(()));
    assert_eq!(alloc.class_name(meshes), None);

    alloc.free(a1).unwrap();
    alloc.close_class(audio).unwrap();
    assert_eq!(alloc.close(), Ok(()));
}

#[test]
fn test_resize_keeps_class_and_contents() {
    let alloc = quiet();
    let textures = alloc.create_class("textures").unwrap();
    let ptr = alloc.alloc(textures, "atlas", 8).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(b"12345678".as_ptr(), ptr, 8) };

    let bigger = alloc.resize(ptr, 128).unwrap();
    assert_eq!(unsafe { std::slice::from_raw_parts(bigger, 8) }, b"12345678");
    assert_eq!(
        alloc.class_memory(textures, StatScope::Current).unwrap().blocks,
        1
    );

    alloc.free(bigger).unwrap();
    alloc.close_class(textures).unwrap();
}

#[test]
fn test_block_enumeration_visits_every_block() {
    let alloc = quiet();
    let mut ptrs = Vec::new();
    for i in 0..5usize {
        ptrs.push(alloc.alloc(ClassId::DEFAULT, "walk", 16 + i).unwrap());
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    while let Some(ptr) = alloc.next_block(cursor).unwrap() {
        seen.push(ptr);
        cursor = Some(ptr as *const u8);
    }
    assert_eq!(seen.len(), ptrs.len());
    for ptr in ptrs {
        assert!(seen.contains(&ptr));
        alloc.free(ptr).unwrap();
    }
}

#[test]
fn test_trace_log_records_operations() {
    let path = std::env::temp_dir().join(format!("guardalloc-trace-{}.log", std::process::id()));
    let alloc = GuardAlloc::new(
        AllocConfig::default()
            .with_mode(Mode::TRACE)
            .with_trace_file(&path),
    );

    let ptr = alloc.alloc(ClassId::DEFAULT, "traced", 64).unwrap();
    alloc.free(ptr).unwrap();
    alloc.close().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("A DEFAULT traced 64 "));
    assert!(lines[0].ends_with("OK"));
    assert!(lines[1].starts_with("F DEFAULT traced 64 "));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_guarded_copy_truncates_and_block_survives() {
    let (alloc, seen) = recording();
    let dst = alloc.alloc(ClassId::DEFAULT, "dst", 16).unwrap();
    let src = [0xEEu8; 64];

    let result = unsafe { alloc.guarded_mem_copy(dst, UNKNOWN_CAP, src.as_ptr(), 64) };
    assert_eq!(result, Err(ErrorCode::RtlDamage));
    assert_eq!(seen.lock()[0], (ErrorCode::RtlDamage, 16));

    // The copy was clamped at the block boundary: canaries intact.
    assert_eq!(alloc.check_block(Some(dst as *const u8)), Ok(()));
    alloc.free(dst).unwrap();
}

#[test]
fn test_degraded_checks_until_re_enabled() {
    let alloc = GuardAlloc::new(AllocConfig::default().with_mode(Mode::DEBUG));
    alloc.set_error_hook(Some(Arc::new(|_| Verdict::Continue)));

    let ptr = alloc.alloc(ClassId::DEFAULT, "victim", 16).unwrap();
    unsafe { *ptr.add(16) = 0 };
    assert_eq!(
        alloc.check_block(Some(ptr as *const u8)),
        Err(ErrorCode::BlockDamage)
    );

    // Continued fatal damage masks DEBUG, so allocation proceeds
    // without the full-heap scan tripping over the damaged block.
    assert!(!alloc.current_mode().contains(Mode::DEBUG));
    let other = alloc.alloc(ClassId::DEFAULT, "after", 16).unwrap();
    alloc.free(other).unwrap();

    alloc.re_enable_checks();
    assert!(alloc.current_mode().contains(Mode::DEBUG));
    // With checks re-armed, the sweep reports the damage again.
    assert_eq!(
        alloc.alloc(ClassId::DEFAULT, "blocked", 16),
        Err(ErrorCode::BlockDamage)
    );
}

#[test]
fn test_handles_share_one_instance() {
    let alloc = quiet();
    let other = alloc.clone();

    let ptr = alloc.alloc(ClassId::DEFAULT, "shared", 32).unwrap();
    assert_eq!(other.block_size(ptr), Ok(32));
    other.free(ptr).unwrap();
    assert_eq!(alloc.total_memory(StatScope::Current).blocks, 0);
}

#[test]
fn test_concurrent_alloc_free() {
    let alloc = quiet();
    let mut handles = Vec::new();
    for t in 0..4usize {
        let alloc = alloc.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100 {
                let ptr = alloc
                    .alloc(ClassId::DEFAULT, "worker", 16 + (t * 100 + i) % 64)
                    .unwrap();
                unsafe { *ptr = t as u8 };
                alloc.free(ptr).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(alloc.total_memory(StatScope::Current).blocks, 0);
    assert_eq!(alloc.close(), Ok(()));
}

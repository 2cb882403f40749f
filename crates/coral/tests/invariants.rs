//! Engine laws: round trips, padding, conversion, zero-count, subset sync,
//! stat reporting, and failure recovery.

use coral::prelude::*;

fn i32_vector(len: i64) -> Descriptor {
    Descriptor::vector(ElemType::Integer, 4, 4, len)
}

/// Law 3: a contiguous send/get round trip is byte-identical.
#[test]
fn test_round_trip_contiguous() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let desc = i32_vector(8);
            let token = rt.register(32, RegisterKind::Coarray, Some(desc.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 1 {
                let data: Vec<i32> = (0..8).map(|v| v * 7 - 3).collect();
                let a = LocalArray::from_elements(desc.clone(), &data)?;
                rt.send(token, 0, 2, &desc, a.desc(), a.bytes(), false)?;
                rt.sync_memory()?;

                let mut b = LocalArray::new(desc.clone());
                rt.get(token, 0, 2, &desc, &desc, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), data);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Law 4: the same round trip through a non-unit-stride section.
#[test]
fn test_round_trip_strided() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let full = i32_vector(10);
            let token = rt.register(40, RegisterKind::Coarray, Some(full.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 2 {
                // Elements {0, 3, 6, 9} of the remote array.
                let section = Descriptor::array(
                    ElemType::Integer,
                    4,
                    4,
                    &[Dim::new(1, 4, 3)],
                )?;
                let dense = i32_vector(4);
                let a = LocalArray::from_elements(dense.clone(), &[11i32, 22, 33, 44])?;
                rt.send(token, 0, 1, &section, a.desc(), a.bytes(), false)?;

                let mut b = LocalArray::new(dense.clone());
                rt.get(token, 0, 1, &section, &dense, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), vec![11, 22, 33, 44]);
            }
            rt.sync_all()?;

            if rt.this_image() == 1 {
                // The scattered elements landed at stride 3; the gaps are 0.
                let mut whole = LocalArray::new(full.clone());
                rt.get(token, 0, 1, &full, &full, whole.bytes_mut(), false)?;
                assert_eq!(
                    whole.to_elements::<i32>(),
                    vec![11, 0, 0, 22, 0, 0, 33, 0, 0, 44]
                );
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// The per-element strided policy moves the same bytes as the vectored one.
#[test]
fn test_round_trip_strided_per_element_policy() {
    let config = RuntimeConfig::builder()
        .strided(StridedStrategy::PerElement)
        .build();
    let report = Coral::builder()
        .num_images(2)
        .config(config)
        .build()
        .launch(|rt| {
            let full = i32_vector(6);
            let token = rt.register(24, RegisterKind::Coarray, Some(full.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 2 {
                let section =
                    Descriptor::array(ElemType::Integer, 4, 4, &[Dim::new(1, 3, 2)])?;
                let dense = i32_vector(3);
                let a = LocalArray::from_elements(dense.clone(), &[5i32, 6, 7])?;
                rt.send(token, 0, 1, &section, a.desc(), a.bytes(), false)?;

                let mut b = LocalArray::new(dense.clone());
                rt.get(token, 0, 1, &section, &dense, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), vec![5, 6, 7]);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Law 2: a zero-extent transfer must not touch the target.
#[test]
fn test_zero_count_is_noop() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let desc = i32_vector(4);
            let token = rt.register(16, RegisterKind::Coarray, Some(desc.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 1 {
                let a = LocalArray::from_elements(desc.clone(), &[9i32, 9, 9, 9])?;
                rt.send(token, 0, 2, &desc, a.desc(), a.bytes(), false)?;
                rt.sync_memory()?;

                let empty = Descriptor::array(ElemType::Integer, 4, 4, &[Dim::new(1, 0, 1)])?;
                let nothing = LocalArray::new(empty.clone());
                rt.send(token, 0, 2, &empty, nothing.desc(), nothing.bytes(), false)?;

                let mut b = LocalArray::new(desc.clone());
                rt.get(token, 0, 2, &desc, &desc, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), vec![9, 9, 9, 9]);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Law 5: sending a short CHARACTER into a longer one space-pads the tail.
#[test]
fn test_character_padding() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let wide = Descriptor::vector(ElemType::Character, 1, 8, 1);
            let token = rt.register(8, RegisterKind::Coarray, Some(wide.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 1 {
                let narrow = Descriptor::vector(ElemType::Character, 1, 3, 1);
                rt.send(token, 0, 2, &wide, &narrow, b"abc", false)?;

                let mut b = LocalArray::new(wide.clone());
                rt.get(token, 0, 2, &wide, &wide, b.bytes_mut(), false)?;
                assert_eq!(b.bytes(), b"abc     ");
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Law 6: integer kind conversion sign-extends on widening and keeps the
/// low bits on narrowing.
#[test]
fn test_kind_conversion_transfers() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let wide = Descriptor::vector(ElemType::Integer, 8, 8, 2);
            let token = rt.register(16, RegisterKind::Coarray, Some(wide.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 1 {
                let narrow = i32_vector(2);
                let a = LocalArray::from_elements(narrow.clone(), &[-5i32, 123])?;
                rt.send(token, 0, 2, &wide, a.desc(), a.bytes(), false)?;

                let mut b = LocalArray::new(wide.clone());
                rt.get(token, 0, 2, &wide, &wide, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i64>(), vec![-5, 123]);

                // Narrowing get: the low 32 bits come back.
                let mut c = LocalArray::new(narrow.clone());
                rt.get(token, 0, 2, &wide, &narrow, c.bytes_mut(), false)?;
                assert_eq!(c.to_elements::<i32>(), vec![-5, 123]);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// sendget moves data between two peers through the initiating image.
#[test]
fn test_sendget_between_peers() {
    let report = Coral::builder()
        .num_images(3)
        .build()
        .launch(|rt| {
            let desc = i32_vector(4);
            let token = rt.register(16, RegisterKind::Coarray, Some(desc.clone()))?;
            rt.sync_all()?;

            if rt.this_image() == 2 {
                let a = LocalArray::from_elements(desc.clone(), &[4i32, 3, 2, 1])?;
                rt.send(token, 0, 2, &desc, a.desc(), a.bytes(), false)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 1 {
                rt.sendget(token, 0, 3, &desc, token, 0, 2, &desc)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 3 {
                let mut b = LocalArray::new(desc.clone());
                rt.get(token, 0, 3, &desc, &desc, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), vec![4, 3, 2, 1]);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Law 9 (first half): disjoint subsets synchronize independently.
#[test]
fn test_subset_sync_disjoint_pairs() {
    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(|rt| {
            match rt.this_image() {
                1 | 4 => rt.sync_images(ImageSet::Images(&[1, 4]))?,
                _ => rt.sync_images(ImageSet::Images(&[2, 3]))?,
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Duplicate indices in the sync set are reported as DUP_SYNC_IMAGES.
#[test]
fn test_subset_sync_duplicate_stat() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let mut stat = -1;
            let mut errmsg = [0u8; 40];
            rt.with_stat(Some(&mut stat), Some(&mut errmsg[..]), |rt| {
                rt.sync_images(ImageSet::Images(&[2, 2]))
            })?;
            assert_eq!(stat, coral::types::stat::DUP_SYNC_IMAGES);
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Law 9 (second half): a stopping image releases subset-sync waiters with
/// STOPPED_IMAGE, and the waiters can stop in turn.
#[test]
fn test_subset_sync_observes_stop() {
    let report = Coral::builder()
        .num_images(3)
        .build()
        .launch(|rt| {
            if rt.this_image() == 1 {
                // Give the waiters a moment to post their receives.
                std::thread::sleep(std::time::Duration::from_millis(10));
                return Err(rt.stop_numeric(5));
            }
            match rt.sync_images(ImageSet::Images(&[1])) {
                Err(CoralError::StoppedImage) => Err(rt.stop_numeric(0)),
                other => {
                    other?;
                    panic!("expected the stop to be observed");
                }
            }
        })
        .unwrap();
    assert_eq!(*report.image(1), ImageExit::Stopped { code: 5 });
    assert_eq!(*report.image(2), ImageExit::Stopped { code: 0 });
    assert_eq!(*report.image(3), ImageExit::Stopped { code: 0 });
}

/// Locking a slot this image already holds reports stat 99.
#[test]
fn test_mutex_self_deadlock_stat() {
    let report = Coral::builder()
        .num_images(1)
        .build()
        .launch(|rt| {
            let token = rt.register(1, RegisterKind::Lock, None)?;
            rt.lock(token, 0, 1, None)?;

            let mut stat = -1;
            let mut errmsg = [0u8; 20];
            rt.with_stat(Some(&mut stat), Some(&mut errmsg[..]), |rt| {
                rt.lock(token, 0, 1, None)
            })?;
            assert_eq!(stat, coral::types::stat::ALREADY_LOCKED);
            assert_eq!(&errmsg[..14], b"Already locked");
            assert!(errmsg[14..].iter().all(|&b| b == b' '));

            rt.unlock(token, 0, 1)?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// The non-blocking acquired_lock form never spins.
#[test]
fn test_lock_acquired_flag() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let token = rt.register(1, RegisterKind::Lock, None)?;
            rt.sync_all()?;

            if rt.this_image() == 1 {
                rt.lock(token, 0, 1, None)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 2 {
                let mut got = true;
                rt.lock(token, 0, 1, Some(&mut got))?;
                assert!(!got, "lock is held by image 1");
            }
            rt.sync_all()?;

            if rt.this_image() == 1 {
                rt.unlock(token, 0, 1)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 2 {
                let mut got = false;
                rt.lock(token, 0, 1, Some(&mut got))?;
                assert!(got);
                rt.unlock(token, 0, 1)?;
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Atomics: define, ref, cas and fetch-op against a peer's slot.
#[test]
fn test_atomics_across_images() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let token = rt.register(2, RegisterKind::Event, None)?;
            rt.sync_all()?;

            if rt.this_image() == 2 {
                rt.atomic_define(token, 0, 1, 41, 4)?;
                let old = rt.atomic_op(AtomicOpCode::Add, token, 0, 1, 1, 4)?;
                assert_eq!(old, 41);
                let old = rt.atomic_cas(token, 0, 1, 42, 7, 4)?;
                assert_eq!(old, 42);
                assert_eq!(rt.atomic_ref(token, 0, 1, 4)?, 7);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// co_reduce with a user operator, co_max, and co_broadcast.
#[test]
fn test_collectives_user_op_and_broadcast() {
    let report = Coral::builder()
        .num_images(3)
        .build()
        .launch(|rt| {
            // Product over images: 2 * 3 * 4.
            let me = rt.this_image() as i32;
            let mut a = LocalArray::from_elements(i32_vector(1), &[me + 1])?;
            rt.co_reduce(&mut a, ReduceOperator::I32(|x, y| x * y), 0)?;
            assert_eq!(a.to_elements::<i32>(), vec![24]);

            let mut m = LocalArray::from_elements(i32_vector(2), &[me, -me])?;
            rt.co_max(&mut m, 0)?;
            assert_eq!(m.to_elements::<i32>(), vec![3, -1]);

            let mut b = LocalArray::from_elements(i32_vector(3), &[me, me, me])?;
            rt.co_broadcast(&mut b, 2)?;
            assert_eq!(b.to_elements::<i32>(), vec![2, 2, 2]);

            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// A deregistered token's window is gone; registration after it works.
#[test]
fn test_deregister_and_reregister() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            let desc = i32_vector(4);
            let first = rt.register(16, RegisterKind::Coarray, Some(desc.clone()))?;
            rt.deregister(first, DeregisterMode::Full)?;
            assert!(rt.lookup(first).is_err());

            let second = rt.register(16, RegisterKind::Coarray, Some(desc))?;
            rt.sync_all()?;
            rt.deregister(second, DeregisterMode::Full)?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Slave tokens can be deallocated and re-allocated in place.
#[test]
fn test_slave_reallocation_keeps_token() {
    let report = Coral::builder()
        .num_images(1)
        .build()
        .launch(|rt| {
            let (slave, first_addr) = rt.register_slave(16, None)?;
            assert_ne!(first_addr, 0);

            rt.deregister(slave, DeregisterMode::DeallocateOnly)?;
            assert_eq!(rt.lookup_slave(slave)?, 0);

            let second_addr = rt.slave_reallocate(slave, 32, None)?;
            assert_ne!(second_addr, 0);
            rt.with_slave_memory(slave, |mem| assert_eq!(mem.len(), 32))?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Without failure handling, image_status reports 0 (ABI compatibility).
#[test]
fn test_image_status_without_failure_handling() {
    let report = Coral::builder()
        .num_images(2)
        .build()
        .launch(|rt| {
            assert_eq!(rt.image_status(1)?, 0);
            assert_eq!(rt.image_status(2)?, 0);
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// Failure handling: a failed image is detected, the communicator is
/// repaired, and the survivors keep running.
#[test]
fn test_failure_recovery() {
    let report = Coral::builder()
        .num_images(3)
        .failure_handling(true)
        .build()
        .launch(|rt| {
            if rt.this_image() == 3 {
                std::thread::sleep(std::time::Duration::from_millis(20));
                return Err(rt.fail_image());
            }

            // The first fence after the failure reports it.
            let mut stat = 0;
            loop {
                rt.with_stat(Some(&mut stat), None, |rt| rt.sync_all())?;
                match stat {
                    s if s == coral::types::stat::FAILED_IMAGE => break,
                    0 => continue,
                    other => panic!("unexpected stat {other}"),
                }
            }

            assert_eq!(rt.image_status(3)?, coral::types::stat::FAILED_IMAGE);
            let failed = rt.failed_images(4)?;
            assert_eq!(failed.to_elements::<i32>(), vec![3]);

            // The repaired communicator carries the survivors.
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert_eq!(
        *report.image(3),
        ImageExit::Stopped {
            code: coral::types::stat::FAILED_IMAGE
        }
    );
    assert!(matches!(*report.image(1), ImageExit::Normal), "{report:?}");
    assert!(matches!(*report.image(2), ImageExit::Normal), "{report:?}");
}

/// send_by_ref remains an explicit unimplemented stub.
#[test]
fn test_send_by_ref_unimplemented() {
    let report = Coral::builder()
        .num_images(1)
        .build()
        .launch(|rt| {
            let token = rt.register(8, RegisterKind::Coarray, None)?;
            let refs = [RefNode::Component {
                offset: 0,
                token_offset: 0,
                item_size: 8,
            }];
            let src = LocalArray::new(Descriptor::scalar(ElemType::Integer, 8, 8));
            let err = rt.send_by_ref(token, 1, &refs, &src).unwrap_err();
            assert!(matches!(err, CoralError::Unsupported(_)));
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

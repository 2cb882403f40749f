//! Cross-image scenarios over a four-image in-process fleet.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coral::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn i32_vector(len: i64) -> Descriptor {
    Descriptor::vector(ElemType::Integer, 4, 4, len)
}

/// S1: a contiguous get of a length-10 integer coarray from a peer.
#[test]
fn test_s1_contiguous_get_across_images() {
    init_tracing();
    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(|rt| {
            let desc = i32_vector(10);
            let token = rt.register(40, RegisterKind::Coarray, Some(desc.clone()))?;

            if rt.this_image() == 1 {
                let data: Vec<i32> = (1..=10).collect();
                let a = LocalArray::from_elements(desc.clone(), &data)?;
                rt.send(token, 0, 1, &desc, a.desc(), a.bytes(), false)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 2 {
                let mut b = LocalArray::new(desc.clone());
                rt.get(token, 0, 1, &desc, &desc, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), (1..=10).collect::<Vec<i32>>());
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// S2: a strided section [1:4:2, 1:4:2] of a 4x4 coarray.
#[test]
fn test_s2_strided_section_get() {
    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(|rt| {
            let full = Descriptor::array(
                ElemType::Integer,
                4,
                4,
                &[Dim::new(1, 4, 1), Dim::new(1, 4, 4)],
            )?;
            let token = rt.register(64, RegisterKind::Coarray, Some(full.clone()))?;

            if rt.this_image() == 1 {
                let data: Vec<i32> = (0..16).collect();
                let a = LocalArray::from_elements(full.clone(), &data)?;
                rt.send(token, 0, 1, &full, a.desc(), a.bytes(), false)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 3 {
                let section = Descriptor::array(
                    ElemType::Integer,
                    4,
                    4,
                    &[Dim::new(1, 2, 2), Dim::new(1, 2, 8)],
                )?;
                let dest = Descriptor::array(
                    ElemType::Integer,
                    4,
                    4,
                    &[Dim::new(1, 2, 1), Dim::new(1, 2, 2)],
                )?;
                let mut b = LocalArray::new(dest.clone());
                rt.get(token, 0, 1, &section, &dest, b.bytes_mut(), false)?;
                assert_eq!(b.to_elements::<i32>(), vec![0, 2, 8, 10]);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// S3: mutual exclusion through a lock slot on image 1.
#[test]
fn test_s3_mutex_exclusion() {
    let in_section = Arc::new(AtomicI32::new(0));
    let section = Arc::clone(&in_section);

    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(move |rt| {
            let token = rt.register(1, RegisterKind::Lock, None)?;
            rt.sync_all()?;

            if rt.this_image() == 2 || rt.this_image() == 3 {
                rt.lock(token, 0, 1, None)?;
                let holders = section.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(holders, 1, "two images inside the critical section");
                std::thread::sleep(Duration::from_millis(5));
                section.fetch_sub(1, Ordering::SeqCst);
                rt.unlock(token, 0, 1)?;
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// S4: three posts satisfy a wait for three, leaving the counter at zero.
#[test]
fn test_s4_event_wait_and_drain() {
    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(|rt| {
            let token = rt.register(6, RegisterKind::Event, None)?;
            rt.sync_all()?;

            if rt.this_image() == 1 {
                rt.event_wait(token, 5, 3)?;
                assert_eq!(rt.event_query(token, 5, 0)?, 0);
            } else {
                rt.event_post(token, 5, 1)?;
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// S5: co_sum over [1,2,3,4] replicated on four images.
#[test]
fn test_s5_co_sum_allreduce() {
    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(|rt| {
            let mut a = LocalArray::from_elements(i32_vector(4), &[1i32, 2, 3, 4])?;
            rt.co_sum(&mut a, 0)?;
            assert_eq!(a.to_elements::<i32>(), vec![4, 8, 12, 16]);
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

/// S6: get_by_ref through an allocatable rank-2 component of a derived
/// coarray, starting from a null destination.
#[test]
fn test_s6_get_by_ref_allocatable_component() {
    init_tracing();
    // The derived object is one embedded component descriptor (80 bytes for
    // rank 2) followed by the component's token handle.
    const TOKEN_OFFSET: u64 = 80;
    const OBJECT_SIZE: usize = 88;

    let report = Coral::builder()
        .num_images(4)
        .build()
        .launch(|rt| {
            let token = rt.register(OBJECT_SIZE, RegisterKind::Coarray, None)?;
            rt.sync_all()?;

            let refs = vec![
                RefNode::Component {
                    offset: 0,
                    token_offset: TOKEN_OFFSET,
                    item_size: 8,
                },
                RefNode::Array {
                    item_size: 8,
                    dims: vec![ArrayRefDim::Full { stride: 1 }, ArrayRefDim::Full { stride: 1 }],
                },
            ];

            if rt.this_image() == 3 {
                // Nothing allocated yet anywhere.
                assert!(!rt.is_present(token, 2, &refs)?);
            }
            rt.sync_all()?;

            if rt.this_image() == 2 {
                // Allocate the component: a 3x2 INTEGER*8 array.
                let comp_desc = Descriptor::array(
                    ElemType::Integer,
                    8,
                    8,
                    &[Dim::new(1, 3, 1), Dim::new(1, 2, 3)],
                )?;
                let (slave, addr) = rt.register_slave(48, Some(comp_desc.clone()))?;
                rt.with_slave_memory(slave, |mem| {
                    for (i, chunk) in mem.chunks_exact_mut(8).enumerate() {
                        chunk.copy_from_slice(&(i as i64 + 1).to_ne_bytes());
                    }
                })?;

                // Publish the embedded descriptor inside the derived object.
                let mut blob = [0u8; OBJECT_SIZE];
                comp_desc.encode(addr, &mut blob[..TOKEN_OFFSET as usize]);
                let blob_desc = Descriptor::scalar(ElemType::Derived, 0, OBJECT_SIZE);
                rt.send(token, 0, 2, &blob_desc, &blob_desc, &blob, false)?;
            }
            rt.sync_all()?;

            if rt.this_image() == 3 {
                assert!(rt.is_present(token, 2, &refs)?);
            }
            if rt.this_image() == 4 {
                let mut dst = LocalArray::unallocated(ElemType::Integer, 8, 8, 2);
                rt.get_by_ref(token, 2, &refs, &mut dst, true)?;
                assert!(dst.is_allocated());
                assert_eq!(dst.desc().dim(0).extent(), 3);
                assert_eq!(dst.desc().dim(1).extent(), 2);
                assert_eq!(dst.to_elements::<i64>(), vec![1, 2, 3, 4, 5, 6]);
            }
            rt.sync_all()?;
            Ok(())
        })
        .unwrap();
    assert!(report.all_normal(), "{report:?}");
}

//! Block driver tests against the machine's VirtIO device model.

mod common;

use common::env_with_disk;
use ember_kernel::error::Errno;
use ember_kernel::io::{IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS};
use proptest::prelude::*;

const DISK_BLOCKS: usize = 32;

fn patterned_disk() -> Vec<u8> {
    (0..DISK_BLOCKS * 512).map(|i| (i % 256) as u8).collect()
}

#[test]
fn negotiation_reports_geometry() {
    let mut env = env_with_disk(patterned_disk());
    let io = env.open_blk().unwrap();
    env.with_ctx(|ctx| {
        assert_eq!(io.ctl(ctx, IOCTL_GETBLKSZ, 0).unwrap(), 512);
        assert_eq!(
            io.ctl(ctx, IOCTL_GETLEN, 0).unwrap(),
            (DISK_BLOCKS * 512) as u64
        );
        assert_eq!(io.ctl(ctx, IOCTL_GETPOS, 0).unwrap(), 0);
    });
}

#[test]
fn second_open_is_busy() {
    let mut env = env_with_disk(patterned_disk());
    let _io = env.open_blk().unwrap();
    assert_eq!(env.open_blk().map(|_| ()), Err(Errno::Busy));
}

#[test]
fn reopen_after_close() {
    let mut env = env_with_disk(patterned_disk());
    let io = env.open_blk().unwrap();
    env.with_ctx(|ctx| io.close(ctx));
    assert!(env.open_blk().is_ok());
}

#[test]
fn sequential_read_returns_disk_contents() {
    let mut env = env_with_disk(patterned_disk());
    let io = env.open_blk().unwrap();
    env.with_ctx(|ctx| {
        let mut buf = [0u8; 600];
        assert_eq!(io.read_full(ctx, &mut buf).unwrap(), 600);
        for (i, &b) in buf.iter().enumerate() {
            assert_eq!(b, (i % 256) as u8);
        }
        // Position advanced with the read.
        assert_eq!(io.ctl(ctx, IOCTL_GETPOS, 0).unwrap(), 600);
    });
}

#[test]
fn aligned_write_read_round_trip() {
    let mut env = env_with_disk(vec![0u8; DISK_BLOCKS * 512]);
    let io = env.open_blk().unwrap();
    env.with_ctx(|ctx| {
        // Seek to the third block, write 512 bytes of 0x41, read back.
        io.seek(ctx, 2 * 512).unwrap();
        assert_eq!(io.write_all(ctx, &[0x41; 512]).unwrap(), 512);
        io.seek(ctx, 2 * 512).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(io.read_full(ctx, &mut buf).unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0x41));
    });
}

#[test]
fn unaligned_write_preserves_surrounding_bytes() {
    let mut env = env_with_disk(patterned_disk());
    let io = env.open_blk().unwrap();
    env.with_ctx(|ctx| {
        // Write 100 bytes straddling the first block boundary.
        io.seek(ctx, 500).unwrap();
        assert_eq!(io.write_all(ctx, &[0xEE; 100]).unwrap(), 100);

        io.seek(ctx, 0).unwrap();
        let mut buf = vec![0u8; 1024];
        assert_eq!(io.read_full(ctx, &mut buf).unwrap(), 1024);
        for (i, &b) in buf.iter().enumerate() {
            if (500..600).contains(&i) {
                assert_eq!(b, 0xEE, "byte {i}");
            } else {
                assert_eq!(b, (i % 256) as u8, "byte {i}");
            }
        }
    });
}

#[test]
fn reads_and_writes_clip_at_the_end_of_the_device() {
    let mut env = env_with_disk(vec![0u8; DISK_BLOCKS * 512]);
    let io = env.open_blk().unwrap();
    env.with_ctx(|ctx| {
        let len = (DISK_BLOCKS * 512) as u64;
        io.seek(ctx, len - 10).unwrap();
        assert_eq!(io.write(ctx, &[1u8; 100]).unwrap(), 10);

        io.seek(ctx, len).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(io.read(ctx, &mut buf).unwrap(), 0);

        // Position cannot go past the device.
        assert_eq!(io.seek(ctx, len + 1), Err(Errno::Inval));
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn write_then_read_round_trips(
        pos in 0u64..(DISK_BLOCKS as u64 * 512 - 1024),
        data in proptest::collection::vec(any::<u8>(), 1..1024),
    ) {
        let mut env = env_with_disk(patterned_disk());
        let io = env.open_blk().unwrap();
        env.with_ctx(|ctx| {
            io.seek(ctx, pos).unwrap();
            prop_assert_eq!(io.write_all(ctx, &data).unwrap(), data.len());
            io.seek(ctx, pos).unwrap();
            let mut back = vec![0u8; data.len()];
            prop_assert_eq!(io.read_full(ctx, &mut back).unwrap(), data.len());
            prop_assert_eq!(&back, &data);
            Ok(())
        })?;
    }
}

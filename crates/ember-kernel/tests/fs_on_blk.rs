//! Filesystem mounted on the VirtIO block driver, end to end through
//! the stream interface.

mod common;

use common::env_with_disk;
use ember_fs::{ImageBuilder, BLOCK_SIZE};
use ember_kernel::error::Errno;
use ember_kernel::fs::FileSystem;
use ember_kernel::io::IOCTL_GETLEN;
use proptest::prelude::*;

fn boot_disk() -> Vec<u8> {
    let mut trek = vec![0u8; 2 * BLOCK_SIZE + 17];
    for (i, b) in trek.iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    ImageBuilder::new()
        .file("hello", b"hello from the disk\n")
        .file("trek", &trek)
        .file("rule30", &[0x30; 1000])
        .build()
}

#[test]
fn mount_and_list() {
    let mut env = env_with_disk(boot_disk());
    env.mount_fs();
    let fs = env.kernel.fs().unwrap();
    env.with_ctx(|ctx| {
        assert!(FileSystem::open(&fs, ctx, "hello").is_ok());
        assert!(FileSystem::open(&fs, ctx, "trek").is_ok());
        assert!(FileSystem::open(&fs, ctx, "rule30").is_ok());
        assert_eq!(
            FileSystem::open(&fs, ctx, "absent").map(|_| ()),
            Err(Errno::NoEnt)
        );
    });
}

#[test]
fn file_reads_span_device_blocks() {
    let mut env = env_with_disk(boot_disk());
    env.mount_fs();
    let fs = env.kernel.fs().unwrap();
    env.with_ctx(|ctx| {
        let io = FileSystem::open(&fs, ctx, "trek").unwrap();
        assert_eq!(
            io.ctl(ctx, IOCTL_GETLEN, 0).unwrap(),
            2 * BLOCK_SIZE as u64 + 17
        );

        // Straddle the fs-block boundary, which also straddles several
        // device sectors.
        io.seek(ctx, BLOCK_SIZE as u64 - 8).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(io.read_full(ctx, &mut buf).unwrap(), 16);
        for (i, &b) in buf.iter().enumerate() {
            assert_eq!(b, ((BLOCK_SIZE - 8 + i) % 253) as u8);
        }
    });
}

#[test]
fn writes_land_on_the_device_and_do_not_extend() {
    let mut env = env_with_disk(boot_disk());
    env.mount_fs();
    let fs = env.kernel.fs().unwrap();
    env.with_ctx(|ctx| {
        let io = FileSystem::open(&fs, ctx, "rule30").unwrap();
        io.seek(ctx, 990).unwrap();
        // Only ten bytes remain in a 1000-byte file.
        assert_eq!(io.write(ctx, &[7u8; 64]).unwrap(), 10);
        assert_eq!(io.ctl(ctx, IOCTL_GETLEN, 0).unwrap(), 1000);

        io.seek(ctx, 985).unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(io.read_full(ctx, &mut buf).unwrap(), 15);
        assert_eq!(&buf[..5], &[0x30; 5]);
        assert_eq!(&buf[5..], &[7u8; 10]);
    });

    // The same bytes come back through a second open of the file.
    let fs = env.kernel.fs().unwrap();
    env.with_ctx(|ctx| {
        let io = FileSystem::open(&fs, ctx, "rule30").unwrap();
        io.seek(ctx, 995).unwrap();
        let mut buf = [0u8; 5];
        io.read_full(ctx, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 5]);
    });
}

#[test]
fn eof_and_position_invariants() {
    let mut env = env_with_disk(boot_disk());
    env.mount_fs();
    let fs = env.kernel.fs().unwrap();
    env.with_ctx(|ctx| {
        let io = FileSystem::open(&fs, ctx, "hello").unwrap();
        // Reads at EOF return zero; writes past EOF return zero.
        io.seek(ctx, 20).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(io.read(ctx, &mut buf).unwrap(), 0);
        assert_eq!(io.write(ctx, &buf).unwrap(), 0);
        // Position can never be set past the length.
        assert_eq!(io.seek(ctx, 21), Err(Errno::Inval));
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn fs_write_read_round_trips(
        pos in 0u64..(2 * BLOCK_SIZE as u64),
        data in proptest::collection::vec(any::<u8>(), 1..512),
    ) {
        let mut env = env_with_disk(boot_disk());
        env.mount_fs();
        let fs = env.kernel.fs().unwrap();
        env.with_ctx(|ctx| {
            let io = FileSystem::open(&fs, ctx, "trek").unwrap();
            let len = io.ctl(ctx, IOCTL_GETLEN, 0).unwrap();
            let expect = data.len().min((len - pos) as usize);

            io.seek(ctx, pos).unwrap();
            prop_assert_eq!(io.write(ctx, &data).unwrap(), expect);
            io.seek(ctx, pos).unwrap();
            let mut back = vec![0u8; expect];
            prop_assert_eq!(io.read_full(ctx, &mut back).unwrap(), expect);
            prop_assert_eq!(&back, &data[..expect]);
            Ok(())
        })?;
    }
}

//! End-to-end scenarios: guest programs assembled by hand, packed into a
//! filesystem image, booted, and run through the interpreter until the
//! machine halts.

use ember_fs::ImageBuilder;
use ember_machine::encode;
use ember_machine::ExitReason;
use ember_machine::Register;
use ember_runtime::{Runtime, RuntimeConfig};

const USER_BASE: u64 = 0xC000_0000;
/// Guest code occupies the first 512 bytes of the image; strings and
/// other data follow.
const DATA_OFF: u64 = 0x200;

const A0: Register = Register::A0;
const A1: Register = Register::A1;
const A7: Register = Register::A7;
const T0: Register = Register::T0;
const T1: Register = Register::T1;
const ZERO: Register = Register::ZERO;

// Syscall numbers, as a user program would define them.
const SYS_EXIT: i32 = 0;
const SYS_MSGOUT: i32 = 1;
const SYS_FSOPEN: i32 = 11;
const SYS_EXEC: i32 = 30;
const SYS_FORK: i32 = 31;
const SYS_WAIT: i32 = 32;
const SYS_USLEEP: i32 = 33;

fn syscall(num: i32) -> Vec<u32> {
    vec![encode::addi(A7, ZERO, num), encode::ecall()]
}

fn msgout(str_va: u64) -> Vec<u32> {
    let mut code = encode::li_va(A0, str_va);
    code.extend(syscall(SYS_MSGOUT));
    code
}

fn exit() -> Vec<u32> {
    syscall(SYS_EXIT)
}

/// Build an ELF with one RWX segment: 512 bytes of code, then data.
fn guest_image(code: &[u32], data: &[u8]) -> Vec<u8> {
    assert!(code.len() * 4 <= DATA_OFF as usize, "code overruns data");
    let mut seg = vec![0u8; DATA_OFF as usize];
    for (i, w) in code.iter().enumerate() {
        seg[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    seg.extend_from_slice(data);
    build_elf(USER_BASE, &seg)
}

fn build_elf(entry: u64, segment: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&56u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // one segment
    out.extend_from_slice(&[0u8; 6]); // shentsize/shnum/shstrndx
    out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out.extend_from_slice(&7u32.to_le_bytes()); // RWX
    out.extend_from_slice(&120u64.to_le_bytes()); // p_offset
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(segment.len() as u64).to_le_bytes());
    out.extend_from_slice(&(segment.len() as u64).to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes());
    out.extend_from_slice(segment);
    out
}

fn boot(files: &[(&str, Vec<u8>)]) -> Runtime {
    let mut builder = ImageBuilder::new();
    for (name, data) in files {
        builder = builder.file(name, data);
    }
    Runtime::new(
        builder.build(),
        RuntimeConfig {
            memory_size: 8 * 1024 * 1024,
            mtime_step: 10,
            init: "init".to_string(),
            echo_console: false,
        },
    )
    .expect("boot")
}

fn run_to_halt(runtime: &mut Runtime) -> String {
    assert_eq!(runtime.run().expect("run"), ExitReason::Halt);
    String::from_utf8_lossy(&runtime.console_output()).into_owned()
}

#[test]
fn boot_runs_init_to_completion() {
    let msg_va = USER_BASE + DATA_OFF;
    let mut code = msgout(msg_va);
    code.extend(exit());
    let init = guest_image(&code, b"hello from init\0");

    let mut runtime = boot(&[("init", init)]);
    let output = run_to_halt(&mut runtime);
    assert!(output.contains("says: hello from init"), "output: {output}");
}

#[test]
fn demand_paging_maps_the_faulting_store() {
    // Write 'A' to an unmapped user page, read it back, and print the
    // resulting string. The first store faults; the handler maps a zero
    // page and the store is retried.
    let target = 0xC001_8000u64;
    let mut code = encode::li_va(A1, target);
    code.push(encode::addi(T0, ZERO, 0x41));
    code.push(encode::sb(A1, T0, 0));
    code.push(encode::sb(A1, ZERO, 1));
    code.push(encode::lbu(T1, A1, 0));
    // Mismatch skips the report, so the assertion below would fail.
    let report = msgout(target);
    code.push(encode::bne(T1, T0, 4 * (report.len() as i32 + 1)));
    code.extend(report);
    code.extend(exit());
    let init = guest_image(&code, &[]);

    let mut runtime = boot(&[("init", init)]);
    let output = run_to_halt(&mut runtime);
    assert!(output.contains("says: A"), "output: {output}");
}

#[test]
fn fork_then_wait_orders_parent_after_child() {
    let child_msg = USER_BASE + DATA_OFF;
    let parent_msg = USER_BASE + DATA_OFF + 0x10;

    let mut child = msgout(child_msg);
    child.extend(exit());

    let mut parent = vec![encode::addi(A0, ZERO, 0)];
    parent.extend(syscall(SYS_WAIT));
    parent.extend(msgout(parent_msg));
    parent.extend(exit());

    let mut code = syscall(SYS_FORK);
    code.push(encode::bne(A0, ZERO, 4 * (child.len() as i32 + 1)));
    code.extend(child);
    code.extend(parent);
    let init = guest_image(&code, b"from child\0\0\0\0\0\0from parent\0");

    let mut runtime = boot(&[("init", init)]);
    let output = run_to_halt(&mut runtime);
    let child_at = output.find("says: from child").expect("child spoke");
    let parent_at = output.find("says: from parent").expect("parent spoke");
    assert!(child_at < parent_at, "parent finished before the child");
}

#[test]
fn fork_exec_wait_round_trip() {
    // The child opens a second executable from the filesystem and
    // replaces itself with it; the parent waits for the child to finish.
    let name_va = USER_BASE + DATA_OFF; // "trek\0"
    let parent_msg = USER_BASE + DATA_OFF + 0x10;

    let mut child = vec![encode::addi(A0, ZERO, -1)];
    child.extend(encode::li_va(A1, name_va));
    child.extend(syscall(SYS_FSOPEN));
    child.extend(syscall(SYS_EXEC));
    // Unreached unless exec fails.
    child.extend(exit());

    let mut parent = vec![encode::addi(A0, ZERO, 0)];
    parent.extend(syscall(SYS_WAIT));
    parent.extend(msgout(parent_msg));
    parent.extend(exit());

    let mut code = syscall(SYS_FORK);
    code.push(encode::bne(A0, ZERO, 4 * (child.len() as i32 + 1)));
    code.extend(child);
    code.extend(parent);
    let init = guest_image(&code, b"trek\0\0\0\0\0\0\0\0\0\0\0\0parent done\0");

    let mut trek = msgout(USER_BASE + DATA_OFF);
    trek.extend(exit());
    let trek = guest_image(&trek, b"engage\0");

    let mut runtime = boot(&[("init", init), ("trek", trek)]);
    let output = run_to_halt(&mut runtime);
    let trek_at = output.find("says: engage").expect("exec'd image spoke");
    let done_at = output.find("says: parent done").expect("parent resumed");
    assert!(trek_at < done_at);
}

#[test]
fn illegal_write_kills_only_the_writer() {
    let survived_msg = USER_BASE + DATA_OFF;
    let lived_msg = USER_BASE + DATA_OFF + 0x10;

    // The child stores into an identity-mapped kernel page: the store
    // page fault terminates it before it can speak.
    let mut child = encode::li_va(A1, 0x8000_1468);
    child.push(encode::sb(A1, A1, 0));
    child.extend(msgout(lived_msg));
    child.extend(exit());

    let mut parent = vec![encode::addi(A0, ZERO, 0)];
    parent.extend(syscall(SYS_WAIT));
    parent.extend(msgout(survived_msg));
    parent.extend(exit());

    let mut code = syscall(SYS_FORK);
    code.push(encode::bne(A0, ZERO, 4 * (child.len() as i32 + 1)));
    code.extend(child);
    code.extend(parent);
    let init = guest_image(&code, b"parent survived\0child lived\0");

    let mut runtime = boot(&[("init", init)]);
    let output = run_to_halt(&mut runtime);
    assert!(output.contains("says: parent survived"), "output: {output}");
    assert!(!output.contains("says: child lived"), "output: {output}");
}

#[test]
fn sleeping_threads_wake_after_their_deadline() {
    let awake_msg = USER_BASE + DATA_OFF;

    let sleep_then_report = |tail: Vec<u32>| {
        let mut code = encode::li_va(A0, 100_000);
        code.extend(syscall(SYS_USLEEP));
        code.extend(msgout(awake_msg));
        code.extend(tail);
        code
    };

    let child = sleep_then_report(exit());
    let mut parent_tail = vec![encode::addi(A0, ZERO, 0)];
    parent_tail.extend(syscall(SYS_WAIT));
    parent_tail.extend(exit());
    let parent = sleep_then_report(parent_tail);

    let mut code = syscall(SYS_FORK);
    code.push(encode::bne(A0, ZERO, 4 * (child.len() as i32 + 1)));
    code.extend(child);
    code.extend(parent);
    let init = guest_image(&code, b"awake\0");

    let mut runtime = boot(&[("init", init)]);
    let output = run_to_halt(&mut runtime);
    assert_eq!(
        output.matches("says: awake").count(),
        2,
        "output: {output}"
    );
    // 100 ms at the 10 MHz timebase.
    assert!(runtime.machine_mut().bus.clint.mtime >= 1_000_000);
}

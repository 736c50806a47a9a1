//! Cargo runner for the QEMU harness.
//!
//! Cargo passes the test ELF as the first argument. The runner wraps it in
//! a BIOS disk image, boots it with the ISA debug-exit device and turns the
//! harness's exit code into a process status.

use bootloader::BiosBoot;
use std::env;
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::thread;
use std::time::{Duration, Instant};

/// `(QemuExitCode::Success << 1) | 1`, as QEMU reports it.
const QEMU_SUCCESS: i32 = (0x10 << 1) | 1;

/// A wedged guest (e.g. a triple fault loop) is killed after this long.
const TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> ExitCode {
    // 1. Locate the kernel ELF
    let Some(kernel_path) = env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: runner <kernel-elf>");
        return ExitCode::FAILURE;
    };
    if !kernel_path.exists() {
        eprintln!("Kernel ELF not found at {}", kernel_path.display());
        return ExitCode::FAILURE;
    }

    // 2. Create BIOS disk image next to it
    let disk_image = kernel_path.with_extension("bios.img");
    BiosBoot::new(&kernel_path)
        .create_disk_image(&disk_image)
        .expect("failed to create BIOS disk image");

    // 3. Run QEMU
    let mut qemu = Command::new("qemu-system-x86_64");
    qemu.arg("-drive")
        .arg(format!("format=raw,file={}", disk_image.display()))
        .args(["-device", "isa-debug-exit,iobase=0xf4,iosize=0x04"])
        .args(["-serial", "stdio"])
        .args(["-display", "none"])
        .arg("-no-reboot");

    let mut child = qemu.spawn().expect("failed to run qemu");
    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().expect("failed to wait for qemu") {
            break status;
        }
        if started.elapsed() > TIMEOUT {
            eprintln!("QEMU did not exit within {:?}; killing it", TIMEOUT);
            let _ = child.kill();
            return ExitCode::FAILURE;
        }
        thread::sleep(Duration::from_millis(100));
    };

    match status.code() {
        Some(QEMU_SUCCESS) => ExitCode::SUCCESS,
        code => {
            eprintln!("QEMU exited with {:?}", code);
            ExitCode::FAILURE
        }
    }
}

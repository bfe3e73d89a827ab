//! A Zilog Z80 emulation toolkit: a prefix-aware instruction decoder,
//! a symmetric canonical encoder, and an interpreter over an owned
//! [`Machine`] value with 64 KiB of memory, I/O ports and interrupts.
//!
//! Bytes flow through [`decode`] into [`Instruction`] values; the
//! machine executes them; [`Instruction::encode`] closes the loop for
//! assembly and re-emission.

pub mod decode;
pub mod inst;
pub mod loc;
pub mod machine;
pub mod memory;
pub mod ports;
pub mod registers;
pub mod tables;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use twox_hash::xxh3;

pub use inst::Instruction;
pub use machine::{ExecError, InterruptLine, Machine, Step};

/// A machine plus the provenance of the image it was booted from,
/// snapshottable to disk.
///
/// Port handlers and the interrupt line are not part of a snapshot;
/// hosts re-register them after [`Emulator::load_snapshot`].
#[derive(Serialize, Deserialize)]
pub struct Emulator {
    pub machine: Machine,
    image_name: String,
    #[serde(skip)]
    save_dir: PathBuf,
    image_hash: u64,
}

impl Emulator {
    /// Boot a machine with a flat binary image loaded at `load_addr`.
    pub fn for_image(image: &[u8], load_addr: u16, image_path: &Path) -> Self {
        let image_name = image_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image")
            .to_string();
        let save_dir = image_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let mut machine = Machine::new();
        machine.load_image(load_addr, image);
        machine.regs.pc = load_addr;
        Emulator {
            machine,
            image_name,
            save_dir,
            image_hash: xxh3::hash64(image),
        }
    }

    /// Restore a snapshot, verifying it was taken from `image`.
    pub fn load_snapshot(
        image: &[u8],
        snapshot_path: &Path,
        snapshot: &[u8],
    ) -> anyhow::Result<Self> {
        let mut emu: Emulator =
            rmp_serde::from_slice(snapshot).context("error deserializing snapshot")?;
        if xxh3::hash64(image) != emu.image_hash {
            bail!("the provided image does not match the hash recorded in the snapshot");
        }
        emu.save_dir = snapshot_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Ok(emu)
    }

    /// Write a timestamped snapshot next to the source image.
    pub fn dump_snapshot(&self) -> anyhow::Result<PathBuf> {
        let now = chrono::Local::now();
        let file_name = format!(
            "{}-{}.z80sav",
            self.image_name,
            now.format("%Y%m%dT%H%M%S")
        );
        let path = self.save_dir.join(&file_name);
        let file = File::create(&path)
            .with_context(|| format!("error creating snapshot file {path:?}"))?;
        let mut writer = BufWriter::new(file);
        let bytes = rmp_serde::to_vec(self).context("error serializing snapshot")?;
        writer.write_all(&bytes)?;
        Ok(path)
    }

    /// Execute until HALT; the final value of A is the result.
    pub fn run(&mut self) -> Result<u8, ExecError> {
        self.machine.run()
    }

    pub fn step(&mut self) -> Result<Step, ExecError> {
        self.machine.step()
    }
}

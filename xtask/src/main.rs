use anyhow::{Context, Result};
use clap::Parser;
use prd_common::{
    encode_event_mask, CoreTopology, EventConfig, FileHeader, IbsOpSample, RecordStamp,
    TraceWriter, DE_IBS_OP_ALL, HEADER_FLAG_CALL_STACKS, HEADER_FLAG_IBS_OP, IBS_DC_LIN_ADDR_VALID,
    IBS_DC_LOAD, IBS_DC_MISS, IBS_DC_STORE, IBS_OP_BRANCH_RETIRED, IBS_OP_BRANCH_TAKEN, MODULE_FLAG_KERNEL,
    MODULE_FLAG_SYSTEM, SYSTEM_PID, TIMER_EVENT_MASK,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Write a synthetic PRD trace for manual runs and benchmarks
    SynthTrace {
        #[arg(short, long, default_value = "synthetic.prd")]
        output: PathBuf,
        #[arg(long, default_value = "4")]
        processes: u32,
        #[arg(long, default_value = "2")]
        threads: u32,
        /// Timer samples per thread
        #[arg(long, default_value = "1000")]
        samples: u64,
        #[arg(long, default_value = "4")]
        cpus: u32,
        #[arg(long, default_value = "1")]
        seed: u64,
        /// Add kernel and user call-stack fragments
        #[arg(long)]
        call_stacks: bool,
        /// Add IBS op samples
        #[arg(long)]
        ibs: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::SynthTrace { output, processes, threads, samples, cpus, seed, call_stacks, ibs } => {
            let shape = Shape { processes, threads, samples, cpus, call_stacks, ibs };
            synth_trace(&output, &shape, seed)?;
        }
    }

    Ok(())
}

struct Shape {
    processes: u32,
    threads: u32,
    samples: u64,
    cpus: u32,
    call_stacks: bool,
    ibs: bool,
}

/// Linear congruential generator; traces only need to be reproducible
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n.max(1)
    }
}

const KERNEL_BASE: u64 = 0xffff_ffff_8100_0000;
const APP_BASE: u64 = 0x40_0000;
const LIB_BASE: u64 = 0x7f3a_0000_0000;

fn synth_trace(output: &Path, shape: &Shape, seed: u64) -> Result<()> {
    let mut header = FileHeader::new(shape.cpus);
    header.events.push(EventConfig { event_mask: TIMER_EVENT_MASK, interval: 250_000 });
    if shape.call_stacks {
        header.flags |= HEADER_FLAG_CALL_STACKS;
    }
    if shape.ibs {
        header.flags |= HEADER_FLAG_IBS_OP;
        header.events.push(EventConfig {
            event_mask: encode_event_mask(DE_IBS_OP_ALL, 0, true, true),
            interval: 100_000,
        });
    }
    for core in 0..shape.cpus {
        #[allow(clippy::cast_possible_truncation)]
        header.topology.push(CoreTopology { core, processor: core as u16, numa_node: 0 });
    }

    let mut rng = Lcg(seed);
    let mut writer = TraceWriter::new(header);
    let mut t = 1u64;
    let at = |t: u64, core: u32, pid: u32, tid: u32| RecordStamp::new(t, core, pid, tid);

    writer.module_load(
        at(t, 0, SYSTEM_PID, SYSTEM_PID),
        KERNEL_BASE,
        0x80_0000,
        MODULE_FLAG_KERNEL | MODULE_FLAG_SYSTEM,
        "/boot/vmlinux",
    );
    for p in 0..shape.processes {
        let pid = 1000 + p;
        t += 1;
        writer
            .process_start(at(t, 0, pid, pid), 1, 0, &format!("/usr/bin/worker{p}"))
            .module_load(at(t, 0, pid, pid), APP_BASE, 0x10_0000, 0, &format!("/usr/bin/worker{p}"))
            .module_load(at(t, 0, pid, pid), LIB_BASE, 0x20_0000, MODULE_FLAG_SYSTEM, "/usr/lib/libc.so.6");
    }

    for _ in 0..shape.samples {
        for p in 0..shape.processes {
            let pid = 1000 + p;
            for k in 0..shape.threads {
                t += 1 + rng.below(5);
                let tid = pid * 100 + k;
                #[allow(clippy::cast_possible_truncation)]
                let core = rng.below(u64::from(shape.cpus)) as u32;
                let ip = match rng.below(10) {
                    0 => KERNEL_BASE + rng.below(0x80_0000),
                    1..=3 => LIB_BASE + rng.below(0x2_0000),
                    _ => APP_BASE + rng.below(0x8000),
                };
                writer.sample(at(t, core, pid, tid), TIMER_EVENT_MASK, ip, 1);

                if shape.call_stacks && rng.below(4) == 0 {
                    let in_kernel = ip >= KERNEL_BASE;
                    let kernel_frames: Vec<u64> = if in_kernel {
                        (0..1 + rng.below(4)).map(|_| KERNEL_BASE + rng.below(0x80_0000)).collect()
                    } else {
                        Vec::new()
                    };
                    writer.kernel_call_stack(at(t, core, pid, tid), TIMER_EVENT_MASK, ip, &kernel_frames, true);
                    let user_frames: Vec<u64> =
                        (0..2 + rng.below(6)).map(|_| APP_BASE + rng.below(0x8000)).collect();
                    writer.user_call_stack(at(t, core, pid, tid), t + 1, &user_frames, false);
                }

                if shape.ibs && rng.below(3) == 0 {
                    let dc_data = match rng.below(3) {
                        0 => IBS_DC_LOAD | IBS_DC_MISS | IBS_DC_LIN_ADDR_VALID,
                        1 => IBS_DC_STORE | IBS_DC_LIN_ADDR_VALID,
                        _ => 0,
                    };
                    let op_data = if rng.below(2) == 0 {
                        IBS_OP_BRANCH_RETIRED | IBS_OP_BRANCH_TAKEN
                    } else {
                        0
                    };
                    writer.ibs_op(
                        at(t, core, pid, tid),
                        IbsOpSample {
                            ip: APP_BASE + rng.below(0x8000),
                            op_data,
                            dc_data,
                            dc_lin_addr: 0x5555_0000 + rng.below(0x4000),
                            op_size: 8,
                        },
                    );
                }
            }
        }
    }

    for p in 0..shape.processes {
        t += 1;
        writer.process_exit(at(t, 0, 1000 + p, 1000 + p), 0);
    }

    writer
        .write_to(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("✓ Synthetic trace written");
    println!("  Output:  {}", output.display());
    println!("  Records: {}", writer.record_count());

    Ok(())
}

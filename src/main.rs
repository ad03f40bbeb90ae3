//! vmsup - bring up a VM process context over the support driver.
//!
//! Opens the privileged support session, optionally performs the cookie
//! handshake, creates a VM context with the requested vCPU count and
//! extension table, walks its vCPUs, and tears everything down again. Each
//! failure class prints its own remedy.
//!
//! This tool requires a Unix host. It will not run on other platforms.

#[cfg(unix)]
use vmsup::{sup, uvm};

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "vmsup")]
#[command(about = "Bring up and tear down a VM context over the support driver")]
struct Args {
    /// Path to the support driver device node
    #[arg(short, long, env = "VMSUP_DEVICE", default_value = "/dev/vboxdrv")]
    device: String,

    /// Address space the session should expect to map, in bytes
    #[arg(long, default_value = "0")]
    reserve: usize,

    /// Number of virtual CPUs
    #[arg(short, long, default_value = "1")]
    cpus: u32,

    /// Per-VM extension region as SUBSYSTEM=SIZE (vm, mm, pdm, stam);
    /// repeatable, replaces the default table
    #[arg(short = 'x', long = "extension", value_name = "SUBSYSTEM=SIZE")]
    extensions: Vec<String>,

    /// Per-vCPU VM region size in bytes
    #[arg(long, default_value = "512")]
    vcpu_region: usize,

    /// Allocate and free this many pages before creating the VM
    #[arg(long)]
    probe_pages: Option<usize>,

    /// Perform the cookie handshake with the driver
    #[arg(long)]
    handshake: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        report(&e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(unix)]
fn report(err: &uvm::UvmError) {
    eprintln!("Error: {err}");
    if let Some(remedy) = remedy(err) {
        eprintln!("Hint: {remedy}");
    }
}

#[cfg(not(unix))]
fn report(err: &dyn std::error::Error) {
    eprintln!("Error: {err}");
}

/// What an operator can do about `err`, if anything.
#[cfg(unix)]
fn remedy(err: &uvm::UvmError) -> Option<&'static str> {
    use sup::SupError;
    use uvm::UvmError;

    match err {
        UvmError::Sup(SupError::DriverNotInstalled { .. }) => {
            Some("install the support driver package, then load the kernel module")
        }
        UvmError::Sup(SupError::DriverAbsent { .. }) => {
            Some("the kernel module is not loaded; load it (or reinstall it for the running kernel)")
        }
        UvmError::Sup(SupError::DriverNotAccessible { .. }) => {
            Some("add your user to the group owning the device node and log in again")
        }
        UvmError::Sup(SupError::DriverOpenError { .. }) => {
            Some("check the device path and the kernel log for driver errors")
        }
        UvmError::OutOfMemory { .. } | UvmError::Sup(SupError::OutOfMemory { .. }) => {
            Some("free some host memory or reduce the vCPU count")
        }
        UvmError::InvalidParameter(_) | UvmError::Sup(SupError::InvalidParameter(_)) => {
            Some("check the command line arguments")
        }
        _ => None,
    }
}

/// Parse `SUBSYSTEM=SIZE` into an extension spec.
#[cfg(unix)]
fn parse_extension(arg: &str) -> Result<uvm::ExtensionSpec, uvm::UvmError> {
    use uvm::{ExtensionSpec, Subsystem, UvmError};

    let (name, size) = arg
        .split_once('=')
        .ok_or(UvmError::InvalidParameter("extension must be SUBSYSTEM=SIZE"))?;
    let subsystem = match name.trim().to_ascii_lowercase().as_str() {
        "vm" => Subsystem::Vm,
        "mm" => Subsystem::Mm,
        "pdm" => Subsystem::Pdm,
        "stam" => Subsystem::Stam,
        _ => return Err(UvmError::InvalidParameter("unknown subsystem")),
    };
    let size = size
        .trim()
        .parse()
        .map_err(|_| UvmError::InvalidParameter("extension size is not a number"))?;
    Ok(ExtensionSpec::new(subsystem, size))
}

#[cfg(unix)]
fn run(args: Args) -> Result<(), uvm::UvmError> {
    use sup::{SessionConfig, SupSession};
    use uvm::{ExtensionSpec, Subsystem, UvmRegistry, DEFAULT_VM_EXTENSIONS};

    let vm_extensions = if args.extensions.is_empty() {
        DEFAULT_VM_EXTENSIONS.to_vec()
    } else {
        args.extensions
            .iter()
            .map(|s| parse_extension(s))
            .collect::<Result<Vec<_>, _>>()?
    };
    let cpu_extensions = [ExtensionSpec::new(Subsystem::Vm, args.vcpu_region)];

    log::info!("Device: {}", args.device);
    log::info!("vCPUs: {}", args.cpus);

    let mut session = SupSession::new(SessionConfig {
        device_path: args.device.clone(),
    });
    session.initialize(args.reserve)?;

    if args.handshake {
        let version = session.handshake()?;
        log::info!("Driver interface version {:#x}", version);
    }

    if let Some(pages) = args.probe_pages {
        let block = session.alloc_pages(pages)?;
        log::info!("Probe: {} page(s) at {:p}", block.pages(), block.as_ptr());
        session.free_pages(block);
    }

    let mut registry = UvmRegistry::new();
    let handle = registry.create(&session, args.cpus, &vm_extensions, &cpu_extensions)?;

    {
        let ctx = registry.get(handle)?;
        let layout = ctx.layout();
        log::info!(
            "VM context {} at {:p}: {} bytes, vCPU array at {:#x}, stride {:#x}",
            handle,
            ctx.base(),
            layout.size(),
            layout.vcpu_array(),
            layout.vcpu_stride()
        );
        for region in layout.vm_regions() {
            log::info!(
                "  {:?} region: {:#x}..{:#x}",
                region.subsystem,
                region.offset,
                region.end()
            );
        }
        for vcpu in ctx.vcpus() {
            log::debug!(
                "  vCPU {} owner {:#x}",
                vcpu.cpu_id(),
                vcpu.owner_addr()
            );
        }
    }

    registry.destroy(&session, handle)?;
    if session.live_blocks() != 0 {
        log::warn!("{} page block(s) still outstanding", session.live_blocks());
    }
    session.terminate()?;

    log::info!("Done");
    Ok(())
}

#[cfg(not(unix))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("vmsup requires a Unix host. This platform is not supported.".into())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use uvm::Subsystem;

    #[test]
    fn test_parse_extension() {
        let spec = parse_extension("stam=256").unwrap();
        assert_eq!(spec.subsystem, Subsystem::Stam);
        assert_eq!(spec.size, 256);
        assert_eq!(spec.align, uvm::UVM_ALIGNMENT);

        assert_eq!(parse_extension(" PDM = 128 ").unwrap().subsystem, Subsystem::Pdm);
        assert!(parse_extension("stam").is_err());
        assert!(parse_extension("gui=1").is_err());
        assert!(parse_extension("mm=lots").is_err());
    }

    #[test]
    fn test_remedies_differ_per_open_failure() {
        use sup::SupError;
        use uvm::UvmError;

        let path = String::from("/dev/vboxdrv");
        let remedies: Vec<_> = [
            SupError::DriverNotInstalled { path: path.clone() },
            SupError::DriverAbsent { path: path.clone() },
            SupError::DriverNotAccessible { path: path.clone() },
            SupError::DriverOpenError {
                path,
                errno: nix::errno::Errno::EIO,
            },
        ]
        .into_iter()
        .map(|e| remedy(&UvmError::Sup(e)).unwrap())
        .collect();

        for (i, a) in remedies.iter().enumerate() {
            for b in &remedies[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(remedy(&UvmError::OutOfMemory { pages: 1 }).is_some());
        assert!(remedy(&UvmError::InvalidHandle).is_none());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["vmsup"]);
        assert_eq!(args.cpus, 1);
        assert_eq!(args.vcpu_region, 512);
        assert!(args.extensions.is_empty());
        assert!(!args.handshake);
    }

    #[test]
    fn test_run_against_fake_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let args = Args::parse_from([
            "vmsup",
            "--device",
            file.path().to_str().unwrap(),
            "--cpus",
            "4",
            "-x",
            "vm=512",
            "-x",
            "stam=31",
            "--probe-pages",
            "4",
        ]);
        run(args).unwrap();
    }

    #[test]
    fn test_run_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        let args = Args::parse_from(["vmsup", "--device", path.to_str().unwrap()]);
        assert!(matches!(
            run(args),
            Err(uvm::UvmError::Sup(sup::SupError::DriverNotInstalled { .. }))
        ));
    }
}

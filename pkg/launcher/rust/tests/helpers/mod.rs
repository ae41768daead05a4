// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code, clippy::unwrap_used)]

use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mapdl_launcher::{EnvSnapshot, EnvironmentProber, Launcher, PortAllocator};

/// Prints the gRPC marker for the port it was given, then idles.
pub const GRPC_SOLVER: &str = r#"#!/bin/sh
port=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-port" ]; then port="$2"; fi
    shift
done
echo $$ > solver.pid
echo "Checking out license"
echo "Server listening on 0.0.0.0:$port"
exec sleep 60
"#;

/// Starts but never reports a listener.
pub const SILENT_SOLVER: &str = r#"#!/bin/sh
echo $$ > solver.pid
echo "Checking out license"
exec sleep 60
"#;

/// Dies during startup.
pub const CRASHING_SOLVER: &str = r#"#!/bin/sh
echo "*** ERROR *** no license available"
exit 7
"#;

/// Console solver: asks for a keypress, then echoes commands back.
pub const CONSOLE_SOLVER: &str = r#"#!/bin/sh
echo $$ > solver.pid
echo "press CONTINUE"
read answer
echo "BEGIN:"
while read line; do echo "got $line"; done
"#;

pub fn write_script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_path_buf()
}

/// A directory with `sbatch`, `scontrol` and `scancel` stand-ins. Jobs stay
/// in `state` forever; `scancel` leaves a `cancelled` marker next to them.
pub fn fake_slurm(dir: &Path, state: &str) -> PathBuf {
    let bin = dir.join("slurm-bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(
        &bin.join("sbatch"),
        "#!/bin/sh\necho \"Submitted batch job 4242\"\n",
    );
    write_script(
        &bin.join("scontrol"),
        &format!(
            "#!/bin/sh\n\
             echo \"JobId=4242 JobName=file\"\n\
             echo \"   JobState={state} Reason=Resources BatchHost=(null)\"\n"
        ),
    );
    write_script(
        &bin.join("scancel"),
        &format!("#!/bin/sh\necho \"$1\" > {}\n", bin.join("cancelled").display()),
    );
    bin
}

pub fn prober(path: &str) -> EnvironmentProber {
    EnvironmentProber::new(EnvSnapshot::from_pairs([("PATH", path)])).with_search_roots(vec![])
}

/// A launcher with its own port range, isolated from other tests.
pub fn launcher(path: &str) -> Launcher {
    Launcher::new(prober(path))
        .with_port_allocator(PortAllocator::new(20000..30000))
        .with_grace(Duration::from_millis(500))
        .with_poll_interval(Duration::from_millis(100))
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn read_pid(working_dir: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(raw) = std::fs::read_to_string(working_dir.join("solver.pid"))
            && let Ok(pid) = raw.trim().parse()
        {
            return pid;
        }
        assert!(Instant::now() < deadline, "solver never wrote its pid");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(unix)]
pub fn pid_is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(unix)]
pub fn wait_for_pid_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !pid_is_alive(pid)
}

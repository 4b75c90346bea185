//! Machine descriptor reported at registration.

#[derive(Debug, Clone)]
pub struct MachineReport {
    pub hostname: String,
    pub machine: String,
    pub system: String,
    pub release: String,
}

impl MachineReport {
    pub fn collect() -> Self {
        MachineReport {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            machine: std::env::consts::ARCH.to_owned(),
            system: std::env::consts::OS.to_owned(),
            release: kernel_release(),
        }
    }
}

fn kernel_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

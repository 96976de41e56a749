//! Hardware descriptions shown inside sandboxes.
//!
//! Profiles such as `24v64g` are labels only: every sandbox gets the same
//! real resources. The description derived from the label is written as
//! JSON and mounted into the sandbox, where the image renders it as
//! `/proc`-style files.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Profile used for unknown or malformed labels.
pub const DEFAULT_PROFILE: &str = "24v64g";

/// Path of the description inside the sandbox.
pub const MOUNT_PATH: &str = "/etc/fake.json";

/// vCPU count and memory size parsed from a profile label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Number of virtual CPUs.
    pub vcpus: u32,
    /// Memory in GiB.
    pub memory_gib: u32,
}

impl HardwareProfile {
    /// Parse `<vcpus>v<memory>g`, e.g. `24v64g`.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        let (vcpus, rest) = label.split_once('v')?;
        let memory = rest.strip_suffix('g')?;
        let vcpus: u32 = vcpus.parse().ok()?;
        let memory_gib: u32 = memory.parse().ok()?;
        if vcpus == 0 || memory_gib == 0 || vcpus > 512 || memory_gib > 4096 {
            return None;
        }
        Some(Self { vcpus, memory_gib })
    }

    /// Parse `label`, falling back to [`DEFAULT_PROFILE`].
    pub fn from_label(label: &str) -> Self {
        Self::parse(label).unwrap_or_else(|| {
            tracing::debug!(label, "Unknown profile label, using default");
            Self {
                vcpus: 24,
                memory_gib: 64,
            }
        })
    }

    /// Build the description rendered inside the sandbox.
    pub fn describe(&self) -> HardwareDescription {
        HardwareDescription {
            cpu_cores: self.vcpus,
            cpu_vendor: "GenuineIntel",
            cpu_family: 6,
            cpu_model: "Intel(R) Xeon(R) Platinum 8375C CPU @ 2.90GHz",
            cpu_stepping: 6,
            cpu_model_id: 0x0d00_03a5,
            cpu_mhz: 2900.0,
            cache_size_kb: 55_296,
            flags: CPU_FLAGS,
            bogomips: 5800.0,
            address_sizes: "46 bits physical, 48 bits virtual",
            memory_kb: u64::from(self.memory_gib) * 1024 * 1024,
        }
    }
}

impl fmt::Display for HardwareProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}g", self.vcpus, self.memory_gib)
    }
}

const CPU_FLAGS: &str = "fpu vme de pse tsc msr pae mce cx8 apic sep mtrr pge mca cmov pat \
pse36 clflush mmx fxsr sse sse2 ss ht syscall nx pdpe1gb rdtscp lm constant_tsc rep_good nopl \
xtopology nonstop_tsc cpuid tsc_known_freq pni pclmulqdq ssse3 fma cx16 pcid sse4_1 sse4_2 \
x2apic movbe popcnt tsc_deadline_timer aes xsave avx f16c rdrand hypervisor lahf_lm abm \
3dnowprefetch invpcid_single ssbd ibrs ibpb stibp ibrs_enhanced fsgsbase tsc_adjust bmi1 avx2 \
smep bmi2 erms invpcid avx512f avx512dq rdseed adx smap avx512ifma clflushopt clwb avx512cd \
sha_ni avx512bw avx512vl xsaveopt xsavec xgetbv1 xsaves wbnoinvd ida arat avx512vbmi pku ospke \
avx512_vbmi2 gfni vaes vpclmulqdq avx512_vnni avx512_bitalg tme avx512_vpopcntdq rdpid md_clear \
flush_l1d arch_capabilities";

/// JSON document mounted at [`MOUNT_PATH`].
#[derive(Debug, Clone, Serialize)]
pub struct HardwareDescription {
    pub cpu_cores: u32,
    pub cpu_vendor: &'static str,
    pub cpu_family: u32,
    pub cpu_model: &'static str,
    pub cpu_stepping: u32,
    pub cpu_model_id: u32,
    pub cpu_mhz: f64,
    pub cache_size_kb: u32,
    pub flags: &'static str,
    pub bogomips: f64,
    pub address_sizes: &'static str,
    pub memory_kb: u64,
}

/// Location of the description file for a sandbox.
pub fn description_path(state_dir: &Path, sandbox_name: &str) -> PathBuf {
    state_dir.join("hardware").join(format!("{sandbox_name}.json"))
}

/// Write the description for `profile` and return its host path.
pub async fn write_description(
    state_dir: &Path,
    sandbox_name: &str,
    profile: &str,
) -> std::io::Result<PathBuf> {
    let hardware = HardwareProfile::from_label(profile);
    let path = description_path(state_dir, sandbox_name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec_pretty(&hardware.describe())?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(
        sandbox = sandbox_name,
        profile = %hardware,
        path = %path.display(),
        "Hardware description written"
    );
    Ok(path)
}

/// Remove a description file; a missing file is fine.
pub async fn remove_description(state_dir: &Path, sandbox_name: &str) {
    let path = description_path(state_dir, sandbox_name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove hardware description"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        assert_eq!(
            HardwareProfile::parse("24v64g"),
            Some(HardwareProfile {
                vcpus: 24,
                memory_gib: 64
            })
        );
        assert_eq!(
            HardwareProfile::parse("2V2G"),
            Some(HardwareProfile {
                vcpus: 2,
                memory_gib: 2
            })
        );
        assert_eq!(HardwareProfile::parse("16v"), None);
        assert_eq!(HardwareProfile::parse("0v4g"), None);
        assert_eq!(HardwareProfile::parse("large"), None);
    }

    #[test]
    fn test_unknown_label_falls_back_to_default() {
        let profile = HardwareProfile::from_label("gpu-xl");
        assert_eq!(profile.to_string(), DEFAULT_PROFILE);
    }

    #[test]
    fn test_description_follows_profile() {
        let description = HardwareProfile::from_label("4v16g").describe();
        assert_eq!(description.cpu_cores, 4);
        assert_eq!(description.memory_kb, 16 * 1024 * 1024);
        assert!(description.flags.contains("avx2"));
    }

    #[tokio::test]
    async fn test_write_and_remove_description() {
        let dir = std::env::temp_dir().join(format!("kiosk-hw-{}", std::process::id()));
        let path = write_description(&dir, "kiosk-test", "8v32g").await.unwrap();
        assert_eq!(path, description_path(&dir, "kiosk-test"));

        let raw = tokio::fs::read(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["cpu_cores"], 8);
        assert_eq!(json["memory_kb"], 32 * 1024 * 1024);
        assert_eq!(json["cpu_vendor"], "GenuineIntel");

        remove_description(&dir, "kiosk-test").await;
        assert!(!path.exists());
        // Removing twice is harmless.
        remove_description(&dir, "kiosk-test").await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}

use crate::env::HostEnvironment;
use crate::units::GIGABYTE;

/// No current hardware can hand out this much GPU memory.
pub const HARDWARE_PLAUSIBLE_CEILING: u64 = 256 * GIGABYTE;

/// Largest total allocation the probe may attempt.
///
/// On unified-memory machines a GPU allocation can be satisfied from system
/// RAM and then from swap, so a run that only stops on allocation failure can
/// starve the OS. Bounding the attempt by free disk space keeps swap from
/// being exhausted. Without a disk estimate, total system memory is the
/// bound. Returns 0 when neither is known, meaning "do not test".
pub fn compute_safe_ceiling(env: &dyn HostEnvironment) -> u64 {
    match env.available_storage() {
        Some(storage) if storage > 0 => storage.min(HARDWARE_PLAUSIBLE_CEILING),
        _ => {
            let memory = env.system_memory().unwrap_or(0);
            tracing::debug!(
                "No storage estimate, bounding probe by system memory ({} bytes)",
                memory
            );
            memory
        }
    }
}

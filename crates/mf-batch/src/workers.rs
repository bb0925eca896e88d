//! Worker-count policy.

use mf_core::config::WorkerCount;

/// Logical CPUs available to this process.
pub fn hardware_parallelism() -> usize {
    num_cpus::get().max(1)
}

/// Pool size for a request on a machine with `hardware` logical CPUs.
///
/// `auto` keeps one CPU free (never below one worker); an explicit count is
/// capped at `hardware`.
pub fn resolve_workers(requested: WorkerCount, hardware: usize) -> usize {
    let hardware = hardware.max(1);
    match requested {
        WorkerCount::Auto => hardware.saturating_sub(1).max(1),
        WorkerCount::Fixed(n) => n.clamp(1, hardware),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reserves_one_cpu() {
        assert_eq!(resolve_workers(WorkerCount::Auto, 8), 7);
        assert_eq!(resolve_workers(WorkerCount::Auto, 2), 1);
    }

    #[test]
    fn auto_never_drops_below_one() {
        assert_eq!(resolve_workers(WorkerCount::Auto, 1), 1);
        assert_eq!(resolve_workers(WorkerCount::Auto, 0), 1);
    }

    #[test]
    fn explicit_is_capped_by_hardware() {
        assert_eq!(resolve_workers(WorkerCount::Fixed(4), 8), 4);
        assert_eq!(resolve_workers(WorkerCount::Fixed(16), 8), 8);
        assert_eq!(resolve_workers(WorkerCount::Fixed(1), 8), 1);
    }

    #[test]
    fn hardware_is_positive() {
        assert!(hardware_parallelism() >= 1);
    }
}

// Feature gated wrappers around `tracing` so log statements compile away
// unless the matching `log_*` feature is enabled for this crate.

macro_rules! info {
    ($($t:tt)*) => {
        if cfg!(feature = "log_info") {
            tracing::info!($($t)*);
        }
    };
}

macro_rules! warn {
    ($($t:tt)*) => {
        if cfg!(feature = "log_warnings") {
            tracing::warn!($($t)*);
        }
    };
}

macro_rules! debug {
    ($($t:tt)*) => {
        if cfg!(feature = "log_debug") {
            tracing::debug!($($t)*);
        }
    };
}

macro_rules! error {
    ($($t:tt)*) => {
        if cfg!(feature = "log_errors") {
            tracing::error!($($t)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn gated_macros_accept_format_arguments() {
        let pool = "pool-1";
        info!("connection acquired from {pool}");
        debug!(live = 3, "balance complete");
        warn!("release ignored for {}", pool);
        error!("shutdown signaled twice");
    }
}

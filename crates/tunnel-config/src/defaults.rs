//! Serde default functions backed by `tunnel_core::defaults`.

use tunnel_core::defaults;

/// Generate default value functions that return `tunnel_core` constants.
macro_rules! default_fns {
    ($($fn_name:ident => $const_name:ident : $ty:ty),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> $ty {
                defaults::$const_name
            }
        )*
    };
}

default_fns! {
    default_udp_timeout_secs       => DEFAULT_UDP_TIMEOUT_SECS: u64,
    default_shutdown_timeout_secs  => DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64,
    default_tcp_idle_timeout_secs  => DEFAULT_TCP_IDLE_TIMEOUT_SECS: u64,
    default_probe_timeout_secs     => DEFAULT_PROBE_TIMEOUT_SECS: u64,
    default_relay_buffer_size      => DEFAULT_RELAY_BUFFER_SIZE: usize,
    default_adapter_queue          => DEFAULT_ADAPTER_QUEUE: usize,
    default_session_queue          => DEFAULT_SESSION_QUEUE: usize,
    default_redirector_workers     => DEFAULT_REDIRECTOR_WORKERS: usize,
    default_redirector_queue       => DEFAULT_REDIRECTOR_QUEUE: usize,
    min_relay_buffer_size          => MIN_RELAY_BUFFER_SIZE: usize,
    max_relay_buffer_size          => MAX_RELAY_BUFFER_SIZE: usize,
}

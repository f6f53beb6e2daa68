#[cfg(feature = "log")]
macro_rules! coap_log {
    (trace, $($arg:expr),*) => { log::trace!($($arg),*); };
    (debug, $($arg:expr),*) => { log::debug!($($arg),*); };
    (info, $($arg:expr),*) => { log::info!($($arg),*); };
    (error, $($arg:expr),*) => { log::error!($($arg),*); };
}

#[cfg(not(feature = "log"))]
#[macro_use]
macro_rules! coap_log {
    ($level:ident, $($arg:expr),*) => { $( let _ = $arg; )* }
}

macro_rules! coap_trace {
    ($($arg:expr),*) => (coap_log!(trace, $($arg),*));
}

macro_rules! coap_debug {
    ($($arg:expr),*) => (coap_log!(debug, $($arg),*));
}

macro_rules! coap_info {
    ($($arg:expr),*) => (coap_log!(info, $($arg),*));
}

macro_rules! coap_error {
    ($($arg:expr),*) => (coap_log!(error, $($arg),*));
}

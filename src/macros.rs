// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Internal logging macros. They forward to the `log` crate when the `log`
//! feature is enabled and expand to `()` otherwise, so that call sites don't
//! need their own `cfg` attributes.
//!
//! The `info` and `trace` levels are reserved for work-stealing statistics and
//! are only available with the `log_parallelism` feature.

macro_rules! log_debug {
    ( $($args:tt)* ) => {{
        #[cfg(feature = "log")]
        log::debug!( $($args)* );
    }};
}

macro_rules! log_warn {
    ( $($args:tt)* ) => {{
        #[cfg(feature = "log")]
        log::warn!( $($args)* );
    }};
}

macro_rules! log_error {
    ( $($args:tt)* ) => {{
        #[cfg(feature = "log")]
        log::error!( $($args)* );
    }};
}

#[cfg(feature = "log_parallelism")]
macro_rules! log_info {
    ( $($args:tt)* ) => {
        log::info!( $($args)* )
    };
}

#[cfg(feature = "log_parallelism")]
macro_rules! log_trace {
    ( $($args:tt)* ) => {
        log::trace!( $($args)* )
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
#[cfg(feature = "log_parallelism")]
pub(crate) use log_info;
#[cfg(feature = "log_parallelism")]
pub(crate) use log_trace;
pub(crate) use log_warn;

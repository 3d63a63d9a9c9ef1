//! Module containing structs generated from `proto/`

/// Prometheus remote-write 1.0 messages
pub mod prometheus {
    #![allow(clippy::pedantic)]
    #![allow(missing_docs)]
    #![allow(missing_copy_implementations)]
    include!("proto/prometheus.rs");
}

// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Macros for declaring sets of prometheus metrics.

/// Defines a set of prometheus metrics.
///
/// # Example
///
/// ```
/// use prometheus::{Gauge, Histogram, IntCounter, IntCounterVec};
///
/// backmon_utils::metrics::define_metric_set! {
///     #[namespace = "backmon"]
///     /// Docstring applied to the containing struct.
///     struct MyMetricSet {
///         // Gauges, counters, and histograms can be defined with an empty `[]`.
///         #[help = "Help text and docstring for this metric"]
///         my_int_counter: IntCounter[],
///         #[help = "Help text for the gauge"]
///         my_gauge: Gauge[],
///
///         // Vec-type metrics have their label names specified in the brackets.
///         #[help = "Help text for the int_counter_vec field"]
///         int_counter_vec: IntCounterVec["label1", "label2"],
///
///         // Histograms can additionally have their buckets specified.
///         #[help = "Help text for the histogram"]
///         my_histogram: Histogram { buckets: vec![0.25, 1.0, 10.0] },
///     }
/// }
///
/// let registry = prometheus::Registry::new();
/// let metric_set = MyMetricSet::new(&registry);
/// metric_set.my_int_counter.inc();
/// ```
#[macro_export]
macro_rules! define_metric_set {
    (
        #[namespace = $namespace:literal]
        $(#[$outer:meta])*
        $vis:vis struct $name:ident {
            $(
                #[help = $help_str:literal]
                $field_name:ident: $field_type:ident $field_def:tt
            ),* $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                #[doc = $help_str]
                pub $field_name: $field_type,
            )*
        }

        impl $name {
            /// The namespace in which the metrics reside.
            pub const NAMESPACE: &'static str = $namespace;

            /// Creates a new instance of the metric set, registered with `registry`.
            pub fn new(registry: &prometheus::Registry) -> Self {
                Self { $(
                    $field_name: {
                        let opts = prometheus::Opts::new(stringify!($field_name), $help_str)
                            .namespace($namespace);
                        let metric = $crate::create_metric!($field_type, opts, $field_def);
                        registry
                            .register(Box::new(metric.clone()))
                            .expect("metrics defined at compile time must be valid");
                        metric
                    },
                )* }
            }
        }
    };
}

pub use define_metric_set;

/// Creates a single metric from its type, options, and bracketed definition.
///
/// Used by [`define_metric_set`]; not intended to be called directly.
#[macro_export]
macro_rules! create_metric {
    (Histogram, $opts:expr, {buckets: $buckets:expr $(,)?}) => {{
        let mut opts: prometheus::HistogramOpts = $opts.into();
        opts.buckets = $buckets.into();

        prometheus::Histogram::with_opts(opts)
            .expect("this must be called with valid metrics type and options")
    }};
    ($field_type:ty, $opts:expr, []) => {{
        <$field_type>::with_opts($opts.into())
            .expect("this must be called with valid metrics type and options")
    }};
    ($field_type:ty, $opts:expr, [$($label_name:literal),+ $(,)?]) => {{
        <$field_type>::new($opts.into(), &[$($label_name),+])
            .expect("this must be called with valid metrics type, options, and labels")
    }};
}

pub use create_metric;

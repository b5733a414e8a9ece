use std::default::Default;
use strum_macros::{Display, EnumString};

/// How the stop-the-world coordinator brings mutators to a halt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum SuspendPolicy {
    /// Every mutator is stopped asynchronously by the platform backend, at any instruction.
    Preemptive,
    /// Every mutator stops itself at its next safepoint poll.
    Cooperative,
    /// Threads attached as preemptible are stopped asynchronously, the rest cooperatively.
    Hybrid,
}

/// The default initial bucket count of a `ConcurrentMap`.
pub const DEFAULT_MAP_CAPACITY: usize = 32;
/// The default bucket count of a module's name index.
pub const DEFAULT_NAME_INDEX_BUCKETS: usize = 64;
/// The sleep unit (in microseconds) of the suspend retry backoff.
pub const DEFAULT_SUSPEND_BACKOFF_US: usize = 200;
/// The longest sleep (in microseconds) of the suspend retry backoff.
pub const DEFAULT_SUSPEND_MAX_BACKOFF_US: usize = 10_000;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from its snake_case name and a string value. Return true if the
            /// value was parsed and validated, and false (keeping the old value) otherwise.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_option()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. The old value is kept.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Can't parse value. The old value is kept.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            /// Options without reading environment variables.
            pub fn defaults_only() -> Self {
                Options {
                    $($name: $default),*
                }
            }

            /// Apply every environment variable that starts with `RTCORE_` and names an option
            /// (such as `RTCORE_SUSPEND_POLICY`). Other variables are ignored.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "RTCORE_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Self::defaults_only();
                options.read_env_var_settings();
                options
            }
        }
    ]
}

options! {
    /// Initial bucket count of concurrent maps created by the runtime. Must be a power of two.
    map_initial_capacity:   usize         [|v: &usize| v.is_power_of_two()] = DEFAULT_MAP_CAPACITY,
    /// Bucket count of the name index of each module.
    name_index_buckets:     usize         [|v: &usize| *v > 0] = DEFAULT_NAME_INDEX_BUCKETS,
    /// How mutators are stopped for a collection.
    suspend_policy:         SuspendPolicy [always_valid] = SuspendPolicy::Cooperative,
    /// Sleep unit of the suspend retry backoff, in microseconds.
    suspend_backoff_us:     usize         [|v: &usize| *v > 0] = DEFAULT_SUSPEND_BACKOFF_US,
    /// Upper bound of a single suspend retry sleep, in microseconds.
    suspend_max_backoff_us: usize         [|v: &usize| *v > 0] = DEFAULT_SUSPEND_MAX_BACKOFF_US,
    /// Share the parent's vtable array when a class's vtable is identical to it.
    share_identical_vtables: bool         [always_valid] = true,
}

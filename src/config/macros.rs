/// Configuration macros
///
/// `config_struct!` defines a configuration section with its defaults in one
/// declaration.

/// Define a configuration section with embedded defaults
///
/// Generates the struct with public fields, a `Default` implementation using
/// the listed values, and serde support where missing fields take their
/// default.
///
/// # Example
/// ```
/// chaintx::config_struct! {
///     pub struct PollerConfig {
///         interval_ms: u64 = 5_000,
///         enabled: bool = true,
///     }
/// }
///
/// let config: PollerConfig = toml::from_str("enabled = false").unwrap();
/// assert_eq!(config.interval_ms, 5_000);
/// assert!(!config.enabled);
/// ```
#[macro_export]
macro_rules! config_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_name:ident: $field_type:ty = $default_value:expr
            ),*
            $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field_name: $field_type,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field_name: $default_value,
                    )*
                }
            }
        }
    };
}

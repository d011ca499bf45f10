//! Text mapping for enums stored as TEXT columns

/// Implement `as_str`, `Display` and `FromStr` for a fieldless enum
///
/// Parsing an unknown value yields `Error::Internal`: the text comes from our
/// own tables, so a mismatch means a corrupt row rather than bad input.
#[macro_export]
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::Error::Internal(format!(
                        "Unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#![no_std]

/// Declares one or more newtype structs over an integer type with a fixed
/// set of associated constants, mirroring a C enum that may carry values
/// outside the named set (e.g. a status code space we only partially name).
#[macro_export]
macro_rules! c_enum {
    (
        $(
            $(#[$meta:meta])*
            $vis:vis enum $name:ident: $type:ty {
                $(
                    $element_name:ident = $expr:expr
                )*
            }
        )*
    ) => {
        $(
            $(#[$meta])*
            #[repr(transparent)]
            #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
            $vis struct $name($type);

            #[allow(unused)]
            impl $name {
                $(
                    #[allow(non_upper_case_globals)]
                    pub const $element_name: $name = $name($expr);
                )*

                /// Constructs a value outside the named set, e.g. for a
                /// wire value that doesn't correspond to any known variant.
                #[must_use]
                pub const fn from_raw(value: $type) -> Self {
                    Self(value)
                }

                #[must_use]
                pub const fn raw(self) -> $type {
                    self.0
                }
            }

            impl From<$name> for $type {
                fn from(value: $name) -> Self {
                    value.0
                }
            }
        )*
    };
}

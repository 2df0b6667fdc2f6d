//! Declarative helpers for the hand-maintained schema.

/// Declares a bare constructor: a struct with public fields, its
/// [`Identifiable`](crate::Identifiable) id and both codec impls.
///
/// Serialization writes the constructor id followed by the fields in order;
/// deserialization reads the fields only (the id has already been consumed by
/// the boxed enum or by the caller).
macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $field:ident : $ty:ty ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( pub $field: $ty, )*
        }

        impl $crate::Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                $crate::Serializable::serialize(&<Self as $crate::Identifiable>::CONSTRUCTOR_ID, buf);
                $( $crate::Serializable::serialize(&self.$field, buf); )*
            }
        }

        impl $crate::Deserializable for $name {
            #[allow(unused_variables)]
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                $( let $field = <$ty as $crate::Deserializable>::deserialize(buf)?; )*
                Ok(Self { $( $field, )* })
            }
        }
    };
}

/// Declares a boxed type: an enum whose variants wrap bare constructors.
///
/// Deserialization reads the constructor id and dispatches on it.
macro_rules! tl_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $variant:ident ( $ty:ty ) ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant($ty), )+
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                match self {
                    $( Self::$variant(x) => $crate::Serializable::serialize(x, buf), )+
                }
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                let id = <u32 as $crate::Deserializable>::deserialize(buf)?;
                match id {
                    $(
                        id if id == <$ty as $crate::Identifiable>::CONSTRUCTOR_ID => {
                            Ok(Self::$variant(<$ty as $crate::Deserializable>::deserialize(buf)?))
                        }
                    )+
                    _ => Err($crate::deserialize::Error::UnexpectedConstructor { id }),
                }
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(x: $ty) -> Self { Self::$variant(x) }
            }
        )+
    };
}

/// Declares an RPC function. Same layout as [`tl_object!`] plus the
/// [`RemoteCall`](crate::RemoteCall) return type.
macro_rules! tl_function {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $field:ident : $ty:ty ),* $(,)? } -> $ret:ty
    ) => {
        tl_object! {
            $(#[$meta])*
            $name = $id { $( $field: $ty ),* }
        }

        impl $crate::RemoteCall for $name {
            type Return = $ret;
        }
    };
}

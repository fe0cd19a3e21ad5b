//! Call arguments as an ordered list of individually encoded values.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::codec::Codec;
use crate::error::{Result, RpcError};

/// Encoded call arguments, one blob per parameter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(Vec<ByteBuf>);

impl Arguments {
    /// Wrap pre-encoded argument blobs.
    pub fn from_encoded(values: Vec<Vec<u8>>) -> Self {
        Self(values.into_iter().map(ByteBuf::from).collect())
    }

    /// Encode one value and append it.
    pub fn push<C: Codec, T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.0.push(ByteBuf::from(C::encode(value)?));
        Ok(())
    }

    /// Decode the argument at `index`.
    pub fn get<C: Codec, T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let raw = self.0.get(index).ok_or_else(|| {
            RpcError::Protocol(format!(
                "argument {} requested, call carries {}",
                index,
                self.0.len()
            ))
        })?;
        C::decode(raw)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the call has no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Values that can be encoded as a call's argument list.
pub trait IntoArguments {
    /// Encode each element with `C`.
    fn into_arguments<C: Codec>(self) -> Result<Arguments>;
}

/// Values that can be decoded from a call's argument list.
pub trait FromArguments: Sized {
    /// Decode with `C`, failing if the arity does not match.
    fn from_arguments<C: Codec>(args: &Arguments) -> Result<Self>;
}

impl IntoArguments for Arguments {
    fn into_arguments<C: Codec>(self) -> Result<Arguments> {
        Ok(self)
    }
}

impl FromArguments for Arguments {
    fn from_arguments<C: Codec>(args: &Arguments) -> Result<Self> {
        Ok(args.clone())
    }
}

fn check_arity(args: &Arguments, expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(RpcError::Protocol(format!(
            "expected {} arguments, got {}",
            expected,
            args.len()
        )));
    }
    Ok(())
}

macro_rules! tuple_arguments {
    ($count:expr; $($name:ident $idx:tt),*) => {
        impl<$($name: Serialize),*> IntoArguments for ($($name,)*) {
            #[allow(unused_mut, unused_variables)]
            fn into_arguments<C: Codec>(self) -> Result<Arguments> {
                let mut args = Arguments(Vec::with_capacity($count));
                $( args.push::<C, _>(&self.$idx)?; )*
                Ok(args)
            }
        }

        impl<$($name: DeserializeOwned),*> FromArguments for ($($name,)*) {
            #[allow(unused_variables)]
            fn from_arguments<C: Codec>(args: &Arguments) -> Result<Self> {
                check_arity(args, $count)?;
                Ok(($(args.get::<C, $name>($idx)?,)*))
            }
        }
    };
}

tuple_arguments!(0;);
tuple_arguments!(1; A 0);
tuple_arguments!(2; A 0, B 1);
tuple_arguments!(3; A 0, B 1, D 2);
tuple_arguments!(4; A 0, B 1, D 2, E 3);
tuple_arguments!(5; A 0, B 1, D 2, E 3, F 4);
tuple_arguments!(6; A 0, B 1, D 2, E 3, F 4, G 5);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;

    #[test]
    fn test_tuple_roundtrip() {
        let args = (3i32, "four".to_string(), vec![5u8, 6])
            .into_arguments::<MsgPackCodec>()
            .unwrap();
        assert_eq!(args.len(), 3);

        let (a, b, c): (i32, String, Vec<u8>) = FromArguments::from_arguments::<MsgPackCodec>(&args).unwrap();
        assert_eq!(a, 3);
        assert_eq!(b, "four");
        assert_eq!(c, vec![5, 6]);
    }

    #[test]
    fn test_unit_is_empty() {
        let args = ().into_arguments::<MsgPackCodec>().unwrap();
        assert!(args.is_empty());
        <()>::from_arguments::<MsgPackCodec>(&args).unwrap();
    }

    #[test]
    fn test_arity_mismatch() {
        let args = (1u8,).into_arguments::<MsgPackCodec>().unwrap();
        let err = <(u8, u8)>::from_arguments::<MsgPackCodec>(&args).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_each_argument_encoded_separately() {
        let args = (1u8, 2u8).into_arguments::<MsgPackCodec>().unwrap();
        assert_eq!(args.get::<MsgPackCodec, u8>(1).unwrap(), 2);
        assert!(args.get::<MsgPackCodec, u8>(2).is_err());
    }
}

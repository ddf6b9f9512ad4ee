#![macro_use]

macro_rules! fail {
    ($expr:expr) => {
        return Err(::std::convert::From::from($expr))
    };
}

macro_rules! invalid_argument {
    ($desc:expr) => {
        $crate::errors::CacheError::from(($crate::errors::ErrorKind::InvalidArgument, $desc))
    };
    ($desc:expr, $($detail:tt)+) => {
        $crate::errors::CacheError::from((
            $crate::errors::ErrorKind::InvalidArgument,
            $desc,
            format!($($detail)+),
        ))
    };
}

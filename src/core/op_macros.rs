//! Helper macros that expand to the same owned/borrowed operator impl
//! combinations that `impl_ops::impl_op_ex!` would generate, without
//! relying on that crate's autoref-specialization trick.

#[macro_export]
macro_rules! impl_binop_struct {
    ($trait:ident, $method:ident, $lhs:ty, $rhs:ty, $out:ty, |$a:ident, $b:ident| $body:block) => {
        impl std::ops::$trait<&$rhs> for &$lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: &$rhs) -> $out {
                let $a = self;
                let $b = other;
                $body
            }
        }
        impl std::ops::$trait<$rhs> for $lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: $rhs) -> $out {
                std::ops::$trait::$method(&self, &other)
            }
        }
        impl std::ops::$trait<&$rhs> for $lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: &$rhs) -> $out {
                std::ops::$trait::$method(&self, other)
            }
        }
        impl std::ops::$trait<$rhs> for &$lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: $rhs) -> $out {
                std::ops::$trait::$method(self, &other)
            }
        }
    };
}

#[macro_export]
macro_rules! impl_binop_scalar_rhs {
    ($trait:ident, $method:ident, $lhs:ty, $rhs:ty, $out:ty, |$a:ident, $b:ident| $body:block) => {
        impl std::ops::$trait<$rhs> for &$lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: $rhs) -> $out {
                let $a = self;
                let $b = other;
                $body
            }
        }
        impl std::ops::$trait<$rhs> for $lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: $rhs) -> $out {
                std::ops::$trait::$method(&self, other)
            }
        }
    };
}

#[macro_export]
macro_rules! impl_binop_scalar_lhs {
    ($trait:ident, $method:ident, $lhs:ty, $rhs:ty, $out:ty, |$a:ident, $b:ident| $body:block) => {
        impl std::ops::$trait<&$rhs> for $lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: &$rhs) -> $out {
                let $a = self;
                let $b = other;
                $body
            }
        }
        impl std::ops::$trait<$rhs> for $lhs {
            type Output = $out;
            #[inline]
            fn $method(self, other: $rhs) -> $out {
                std::ops::$trait::$method(self, &other)
            }
        }
    };
}

#[macro_export]
macro_rules! impl_assignop_struct {
    ($trait:ident, $method:ident, $lhs:ty, $rhs:ty, |$a:ident, $b:ident| $body:block) => {
        impl std::ops::$trait<&$rhs> for $lhs {
            #[inline]
            fn $method(&mut self, other: &$rhs) {
                let $a = self;
                let $b = other;
                $body
            }
        }
        impl std::ops::$trait<$rhs> for $lhs {
            #[inline]
            fn $method(&mut self, other: $rhs) {
                std::ops::$trait::$method(self, &other)
            }
        }
    };
}

#[macro_export]
macro_rules! impl_assignop_scalar {
    ($trait:ident, $method:ident, $lhs:ty, $rhs:ty, |$a:ident, $b:ident| $body:block) => {
        impl std::ops::$trait<$rhs> for $lhs {
            #[inline]
            fn $method(&mut self, $b: $rhs) {
                let $a = self;
                $body
            }
        }
    };
}

//! Element traits behind the typed entry points
//!
//! The typed RMA, atomic and reduction surfaces are generic over these
//! traits; monomorphization replaces the macro fan-out a C runtime
//! would use for one function per element type.

/// Plain-old-data element transferable through one-sided operations.
///
/// # Safety
/// Implementors must be valid for any bit pattern and contain no
/// padding that would leak when copied byte-wise.
pub unsafe trait ShmemElem: Copy + Default + Send + Sync + 'static {}

unsafe impl ShmemElem for i8 {}
unsafe impl ShmemElem for i16 {}
unsafe impl ShmemElem for i32 {}
unsafe impl ShmemElem for i64 {}
unsafe impl ShmemElem for u8 {}
unsafe impl ShmemElem for u16 {}
unsafe impl ShmemElem for u32 {}
unsafe impl ShmemElem for u64 {}
unsafe impl ShmemElem for usize {}
unsafe impl ShmemElem for isize {}
unsafe impl ShmemElem for f32 {}
unsafe impl ShmemElem for f64 {}

/// Complex float, layout-compatible with C `float _Complex`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Complex32 {
    pub re: f32,
    pub im: f32,
}

/// Complex double, layout-compatible with C `double _Complex`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

unsafe impl ShmemElem for Complex32 {}
unsafe impl ShmemElem for Complex64 {}

/// Elements supporting sum and product reductions.
pub trait ArithElem: ShmemElem {
    fn add(a: Self, b: Self) -> Self;
    fn mul(a: Self, b: Self) -> Self;
}

/// Elements supporting min and max reductions.
pub trait OrdElem: ShmemElem {
    fn max_v(a: Self, b: Self) -> Self;
    fn min_v(a: Self, b: Self) -> Self;
}

/// Elements supporting bitwise and/or/xor reductions.
pub trait BitElem: ShmemElem {
    fn band(a: Self, b: Self) -> Self;
    fn bor(a: Self, b: Self) -> Self;
    fn bxor(a: Self, b: Self) -> Self;
}

macro_rules! impl_int_elem {
    ($($t:ty),*) => {$(
        impl ArithElem for $t {
            fn add(a: Self, b: Self) -> Self { a.wrapping_add(b) }
            fn mul(a: Self, b: Self) -> Self { a.wrapping_mul(b) }
        }
        impl OrdElem for $t {
            fn max_v(a: Self, b: Self) -> Self { a.max(b) }
            fn min_v(a: Self, b: Self) -> Self { a.min(b) }
        }
        impl BitElem for $t {
            fn band(a: Self, b: Self) -> Self { a & b }
            fn bor(a: Self, b: Self) -> Self { a | b }
            fn bxor(a: Self, b: Self) -> Self { a ^ b }
        }
    )*};
}

impl_int_elem!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

macro_rules! impl_float_elem {
    ($($t:ty),*) => {$(
        impl ArithElem for $t {
            fn add(a: Self, b: Self) -> Self { a + b }
            fn mul(a: Self, b: Self) -> Self { a * b }
        }
        impl OrdElem for $t {
            fn max_v(a: Self, b: Self) -> Self { a.max(b) }
            fn min_v(a: Self, b: Self) -> Self { a.min(b) }
        }
    )*};
}

impl_float_elem!(f32, f64);

impl ArithElem for Complex32 {
    fn add(a: Self, b: Self) -> Self {
        Complex32 {
            re: a.re + b.re,
            im: a.im + b.im,
        }
    }
    fn mul(a: Self, b: Self) -> Self {
        Complex32 {
            re: a.re * b.re - a.im * b.im,
            im: a.re * b.im + a.im * b.re,
        }
    }
}

impl ArithElem for Complex64 {
    fn add(a: Self, b: Self) -> Self {
        Complex64 {
            re: a.re + b.re,
            im: a.im + b.im,
        }
    }
    fn mul(a: Self, b: Self) -> Self {
        Complex64 {
            re: a.re * b.re - a.im * b.im,
            im: a.re * b.im + a.im * b.re,
        }
    }
}

/// Width class of a transport-native atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicWidth {
    W32,
    W64,
}

/// Elements reachable through the transport's 32/64-bit atomics.
pub trait AtomicElem: ShmemElem {
    const WIDTH: AtomicWidth;
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_atomic_elem {
    ($($t:ty => $w:ident),*) => {$(
        impl AtomicElem for $t {
            const WIDTH: AtomicWidth = AtomicWidth::$w;
            fn to_bits(self) -> u64 { self as u64 }
            fn from_bits(bits: u64) -> Self { bits as $t }
        }
    )*};
}

impl_atomic_elem!(i32 => W32, u32 => W32, i64 => W64, u64 => W64, usize => W64, isize => W64);

/// View a typed slice as raw bytes.
pub fn as_bytes<T: ShmemElem>(s: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// View a typed slice as writable raw bytes.
pub fn as_bytes_mut<T: ShmemElem>(s: &mut [T]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(s.as_mut_ptr() as *mut u8, std::mem::size_of_val(s)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_product() {
        let a = Complex32 { re: 1.0, im: 2.0 };
        let b = Complex32 { re: 3.0, im: -1.0 };
        let p = Complex32::mul(a, b);
        assert_eq!(p, Complex32 { re: 5.0, im: 5.0 });
    }

    #[test]
    fn byte_views() {
        let v = [1u32, 2, 3];
        let b = as_bytes(&v);
        assert_eq!(b.len(), 12);
        assert_eq!(b[0], 1);
    }

    #[test]
    fn atomic_bits_round_trip() {
        assert_eq!(i32::from_bits((-5i32).to_bits()), -5);
        assert_eq!(u64::from_bits(u64::MAX.to_bits()), u64::MAX);
        assert_eq!(i32::WIDTH, AtomicWidth::W32);
    }
}

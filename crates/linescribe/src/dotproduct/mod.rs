//! Interchangeable dot-product back ends.
//!
//! Network evaluation spends most of its time in `Σ a[i]·b[i]`. Several
//! implementations compute it: a portable scalar loop (`generic`), a portable
//! multi-accumulator loop the compiler vectorizes well (`native`), and
//! hand-written x86_64 kernels (`sse`, `avx`, `avx2`, `fma`). They agree within
//! floating-point tolerance but not bit for bit, because each sums in a
//! different order.
//!
//! The process-wide selection is made once, lazily, by probing the CPU. It can
//! be overridden with [`select`]; an unsupported name logs a warning listing the
//! valid choices and keeps the current back end. Readers go through
//! [`DotProduct`], a `Copy` handle that network code captures once per call.
//!
//! The working float type is `f32`.

mod portable;
#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod x86;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// A concrete dot-product implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DotProductBackend {
    Generic,
    Native,
    Sse,
    Avx,
    Avx2,
    Fma,
}

impl DotProductBackend {
    const ALL: [DotProductBackend; 6] = [
        DotProductBackend::Generic,
        DotProductBackend::Native,
        DotProductBackend::Sse,
        DotProductBackend::Avx,
        DotProductBackend::Avx2,
        DotProductBackend::Fma,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DotProductBackend::Generic => "generic",
            DotProductBackend::Native => "native",
            DotProductBackend::Sse => "sse",
            DotProductBackend::Avx => "avx",
            DotProductBackend::Avx2 => "avx2",
            DotProductBackend::Fma => "fma",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Whether this binary was built with the kernel and the CPU supports it.
    pub fn is_available(&self) -> bool {
        match self {
            DotProductBackend::Generic | DotProductBackend::Native => true,
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Sse => std::arch::is_x86_feature_detected!("sse"),
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Avx => std::arch::is_x86_feature_detected!("avx"),
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Avx2 => {
                std::arch::is_x86_feature_detected!("avx") && std::arch::is_x86_feature_detected!("avx2")
            }
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Fma => {
                std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
            }
            #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
            _ => false,
        }
    }

    fn tag(self) -> u8 {
        self as u8 + 1
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag).checked_sub(1)?).copied()
    }
}

impl fmt::Display for DotProductBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Back ends usable in this process, slowest first.
pub fn available_backends() -> Vec<DotProductBackend> {
    DotProductBackend::ALL.into_iter().filter(|b| b.is_available()).collect()
}

/// The fastest back end available on this machine.
pub fn detect_best() -> DotProductBackend {
    available_backends()
        .into_iter()
        .next_back()
        .unwrap_or(DotProductBackend::Generic)
}

/// Valid configuration strings for this binary/hardware combination.
pub fn valid_choices() -> Vec<&'static str> {
    let mut choices = vec!["auto"];
    choices.extend(available_backends().iter().map(|b| b.name()));
    choices
}

static SELECTED: AtomicU8 = AtomicU8::new(0);
static DETECTED: OnceCell<DotProductBackend> = OnceCell::new();

/// Run capability detection once and publish the result.
///
/// Idempotent; concurrent callers all observe the same selection.
pub fn init() -> DotProductBackend {
    let detected = *DETECTED.get_or_init(|| {
        let best = detect_best();
        tracing::debug!(backend = %best, "dot product back end detected");
        best
    });
    let _ = SELECTED.compare_exchange(0, detected.tag(), Ordering::AcqRel, Ordering::Acquire);
    current()
}

/// The back end currently in use.
pub fn current() -> DotProductBackend {
    match DotProductBackend::from_tag(SELECTED.load(Ordering::Acquire)) {
        Some(backend) => backend,
        None => init(),
    }
}

/// Apply a configuration choice (`auto`, `generic`, `native`, or a named kernel).
///
/// An unknown or unavailable name is rejected with a warning that lists the
/// valid choices; the previous selection stays active and is returned.
pub fn select(choice: &str) -> DotProductBackend {
    let previous = current();
    let wanted = if choice.trim().eq_ignore_ascii_case("auto") {
        DETECTED.get().copied().or_else(|| Some(detect_best()))
    } else {
        DotProductBackend::from_name(choice).filter(DotProductBackend::is_available)
    };

    match wanted {
        Some(backend) => {
            SELECTED.store(backend.tag(), Ordering::Release);
            if backend != previous {
                tracing::debug!(from = %previous, to = %backend, "dot product back end changed");
            }
            backend
        }
        None => {
            tracing::warn!(
                "dotproduct={} is not supported here, keeping {}. Valid choices: {}",
                choice,
                previous,
                valid_choices().join(", ")
            );
            previous
        }
    }
}

/// A captured back end selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DotProduct {
    backend: DotProductBackend,
}

impl DotProduct {
    /// Handle bound to the process-wide selection at the time of the call.
    pub fn global() -> Self {
        Self { backend: current() }
    }

    /// Handle bound to a specific back end.
    ///
    /// Falls back to `generic` when the back end is not available here, so the
    /// handle is always safe to call.
    pub fn with_backend(backend: DotProductBackend) -> Self {
        if backend.is_available() {
            Self { backend }
        } else {
            Self {
                backend: DotProductBackend::Generic,
            }
        }
    }

    pub fn backend(&self) -> DotProductBackend {
        self.backend
    }

    /// Dot product of the common prefix of `a` and `b`.
    #[inline]
    pub fn compute(&self, a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let (a, b) = (&a[..n], &b[..n]);
        match self.backend {
            DotProductBackend::Generic => portable::dot_generic(a, b),
            DotProductBackend::Native => portable::dot_native(a, b),
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Sse => x86::dot_sse(a, b),
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Avx => x86::dot_avx(a, b),
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Avx2 => x86::dot_avx2(a, b),
            #[cfg(all(feature = "simd", target_arch = "x86_64"))]
            DotProductBackend::Fma => x86::dot_fma(a, b),
            #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
            _ => portable::dot_generic(a, b),
        }
    }
}

impl Default for DotProduct {
    fn default() -> Self {
        Self::global()
    }
}

/// Dot product with the process-wide back end.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    DotProduct::global().compute(a, b)
}

/// Integer dot product used by quantized weight matrices.
#[inline]
pub fn dot_product_i8(a: &[i8], b: &[i8]) -> i32 {
    portable::dot_i8(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_and_native_always_available() {
        let backends = available_backends();
        assert!(backends.contains(&DotProductBackend::Generic));
        assert!(backends.contains(&DotProductBackend::Native));
    }

    #[test]
    fn test_from_name_case_insensitive() {
        assert_eq!(DotProductBackend::from_name("AVX2"), Some(DotProductBackend::Avx2));
        assert_eq!(DotProductBackend::from_name(" generic "), Some(DotProductBackend::Generic));
        assert_eq!(DotProductBackend::from_name("neon9000"), None);
    }

    #[test]
    fn test_tag_roundtrip() {
        for backend in DotProductBackend::ALL {
            assert_eq!(DotProductBackend::from_tag(backend.tag()), Some(backend));
        }
        assert_eq!(DotProductBackend::from_tag(0), None);
    }

    #[test]
    fn test_valid_choices_start_with_auto() {
        let choices = valid_choices();
        assert_eq!(choices[0], "auto");
        assert!(choices.contains(&"generic"));
    }

    #[test]
    fn test_handle_falls_back_when_unavailable() {
        let handle = DotProduct::with_backend(DotProductBackend::Fma);
        if !DotProductBackend::Fma.is_available() {
            assert_eq!(handle.backend(), DotProductBackend::Generic);
        }
        assert_eq!(handle.compute(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }

    #[test]
    fn test_compute_uses_common_prefix() {
        let dp = DotProduct::with_backend(DotProductBackend::Generic);
        assert_eq!(dp.compute(&[1.0, 1.0, 1.0], &[2.0, 2.0]), 4.0);
    }

    #[test]
    fn test_i8_dot_product() {
        assert_eq!(dot_product_i8(&[127, -127, 2], &[1, 1, 3]), 6);
    }
}

//! Runtime CPU feature detection for reduced-precision kernel eligibility
//!
//! Weight prepacking into blocked layouts for BF16 needs AVX-512 BW, VL and DQ;
//! for F16 it needs AVX-512 FP16. Detection uses the raw-cpuid crate and is
//! cached so the pipeline can probe on every `optimize` call for free.
//!
//! # Example
//!
//! ```rust
//! use tuneforge::backend::cpu::cpu_features::CpuFeatures;
//!
//! let features = CpuFeatures::get();
//! if features.has_bf16_support() {
//!     println!("BF16 prepack available");
//! }
//! ```

use once_cell::sync::Lazy;
#[cfg(target_arch = "x86_64")]
use raw_cpuid::CpuId;
use std::fmt;

/// Cached CPU features detected at first use
static CPU_FEATURES: Lazy<CpuFeatures> = Lazy::new(CpuFeatures::detect);

/// CPU feature flags relevant to kernel selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512vl: bool,
    pub avx512dq: bool,
    pub avx512_fp16: bool,
    pub avx2: bool,
    /// ARM NEON (no reduced-precision prepack kernels on this path)
    pub neon: bool,
    pub arch: CpuArch,
}

/// CPU architecture enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86_64,
    Aarch64,
    Other,
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::X86_64 => write!(f, "x86_64"),
            CpuArch::Aarch64 => write!(f, "aarch64"),
            CpuArch::Other => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuFeatures({}", self.arch)?;
        if self.avx512f {
            write!(f, " +AVX512F")?;
        }
        if self.avx512bw && self.avx512vl && self.avx512dq {
            write!(f, " +AVX512BW/VL/DQ")?;
        }
        if self.avx512_fp16 {
            write!(f, " +AVX512FP16")?;
        }
        if self.avx2 {
            write!(f, " +AVX2")?;
        }
        if self.neon {
            write!(f, " +NEON")?;
        }
        write!(f, ")")
    }
}

impl CpuFeatures {
    /// Detect CPU features at runtime. Prefer [`CpuFeatures::get`].
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::detect_x86_64()
        }

        #[cfg(target_arch = "aarch64")]
        {
            Self::none(CpuArch::Aarch64).with_neon()
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Self::none(CpuArch::Other)
        }
    }

    /// Get cached CPU features (detected once)
    #[inline]
    pub fn get() -> Self {
        *CPU_FEATURES
    }

    /// A feature set with nothing enabled. Useful for mocking hardware in tests.
    pub fn none(arch: CpuArch) -> Self {
        Self {
            avx512f: false,
            avx512bw: false,
            avx512vl: false,
            avx512dq: false,
            avx512_fp16: false,
            avx2: false,
            neon: false,
            arch,
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn detect_x86_64() -> Self {
        let cpuid = CpuId::new();
        let ext = cpuid.get_extended_feature_info();
        let has = |f: fn(&raw_cpuid::ExtendedFeatures) -> bool| ext.as_ref().map(f).unwrap_or(false);

        Self {
            avx512f: has(|i| i.has_avx512f()),
            avx512bw: has(|i| i.has_avx512bw()),
            avx512vl: has(|i| i.has_avx512vl()),
            avx512dq: has(|i| i.has_avx512dq()),
            avx512_fp16: has(|i| i.has_avx512_fp16()),
            avx2: has(|i| i.has_avx2()),
            neon: false,
            arch: CpuArch::X86_64,
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn with_neon(mut self) -> Self {
        self.neon = true; // mandatory on ARMv8+
        self
    }

    /// BF16 blocked kernels need AVX-512 BW, VL and DQ
    #[inline]
    pub fn has_bf16_support(&self) -> bool {
        self.avx512bw && self.avx512vl && self.avx512dq
    }

    /// F16 blocked kernels need AVX-512 FP16
    #[inline]
    pub fn has_fp16_support(&self) -> bool {
        self.avx512_fp16
    }

    /// Preferred output-channel block for prepacked weights, in f32 lanes
    pub fn preferred_block(&self) -> usize {
        if self.avx512f {
            16
        } else if self.avx2 {
            8
        } else if self.neon {
            4
        } else {
            1
        }
    }

    /// Log CPU features through tracing
    pub fn log_features(&self) {
        tracing::info!("CPU Architecture: {}", self.arch);
        tracing::info!(
            "Reduced precision: BF16 prepack={}, FP16 prepack={}, block={}",
            self.has_bf16_support(),
            self.has_fp16_support(),
            self.preferred_block()
        );
    }
}

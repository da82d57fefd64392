//! Architectural exception values.
//!
//! Faults are ordinary values propagated with `Result`/`?`, not panics: a
//! privilege or limit violation is the *expected* outcome of large parts of
//! the protection machinery. The dispatcher in [`crate::interrupts`] consumes
//! these values and turns them into guest-visible control transfers.

/// Architecturally defined x86 exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    DivideError = 0,          // #DE
    Debug = 1,                // #DB
    NonMaskableInterrupt = 2, // NMI
    Breakpoint = 3,           // #BP
    Overflow = 4,             // #OF
    BoundRangeExceeded = 5,   // #BR
    InvalidOpcode = 6,        // #UD
    DeviceNotAvailable = 7,   // #NM
    DoubleFault = 8,          // #DF
    CoprocessorOverrun = 9,
    InvalidTss = 10,          // #TS
    SegmentNotPresent = 11,   // #NP
    StackFault = 12,          // #SS
    GeneralProtection = 13,   // #GP
    PageFault = 14,           // #PF
    X87Fpu = 16,              // #MF
    AlignmentCheck = 17,      // #AC
    MachineCheck = 18,        // #MC
    SimdFloatingPoint = 19,   // #XF
    Virtualization = 20,      // #VE
}

impl Vector {
    #[inline]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Vector::DoubleFault
                | Vector::InvalidTss
                | Vector::SegmentNotPresent
                | Vector::StackFault
                | Vector::GeneralProtection
                | Vector::PageFault
                | Vector::AlignmentCheck
        )
    }
}

/// A fault raised by the protection machinery.
///
/// `points_to_self` marks faults whose saved instruction pointer must be
/// rewound to the start of the faulting instruction when the fault is raised
/// mid-delivery of a software interrupt (the INT is restartable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub vector: Vector,
    pub error_code: Option<u32>,
    pub points_to_self: bool,
}

impl Exception {
    pub const fn new(vector: Vector, error_code: Option<u32>) -> Self {
        Self {
            vector,
            error_code,
            points_to_self: false,
        }
    }

    pub const fn pointing_to_self(mut self) -> Self {
        self.points_to_self = true;
        self
    }

    /// #GP(0).
    pub const fn gp0() -> Self {
        Self::new(Vector::GeneralProtection, Some(0))
    }

    /// #GP with a selector error code.
    pub const fn gp(selector: u16) -> Self {
        Self::new(Vector::GeneralProtection, Some(selector as u32 & !0x3))
    }

    /// #NP with a selector error code.
    pub const fn np(selector: u16) -> Self {
        Self::new(Vector::SegmentNotPresent, Some(selector as u32 & !0x3))
    }

    /// #SS with a selector error code (0 for limit violations on a loaded SS).
    pub const fn stack(selector: u16) -> Self {
        Self::new(Vector::StackFault, Some(selector as u32 & !0x3))
    }

    /// #TS with a selector error code.
    pub const fn ts(selector: u16) -> Self {
        Self::new(Vector::InvalidTss, Some(selector as u32 & !0x3))
    }

    /// #PF with an architectural error code. CR2 is recorded at the fault
    /// site by the caller, which knows the linear address.
    pub const fn pf(error_code: u32) -> Self {
        Self::new(Vector::PageFault, Some(error_code))
    }

    pub const fn ud() -> Self {
        Self::new(Vector::InvalidOpcode, None)
    }

    pub const fn de() -> Self {
        Self::new(Vector::DivideError, None)
    }
}

/// Classes from the architectural double-fault compatibility table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    fn of(vector: Vector) -> Self {
        match vector {
            Vector::PageFault => Self::PageFault,
            Vector::DoubleFault => Self::DoubleFault,
            Vector::DivideError
            | Vector::InvalidTss
            | Vector::SegmentNotPresent
            | Vector::StackFault
            | Vector::GeneralProtection => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

/// Whether a `second` fault raised while delivering `first` escalates to #DF.
pub fn should_double_fault(first: Vector, second: Vector) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory | C::PageFault)
            | (C::PageFault, C::Contributory | C::PageFault)
    )
}

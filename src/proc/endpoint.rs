//! Process endpoints
//!
//! An endpoint names a process table slot together with the generation the
//! slot had when the process was created. Reusing a slot bumps its
//! generation, so stale endpoints held by other processes stop matching.

use core::fmt;

/// Index into the process table
pub type ProcNr = usize;

/// Bits of the raw value that hold the slot index
pub const SLOT_BITS: u32 = 12;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

/// Largest generation before it wraps back to 0
pub const MAX_GENERATION: u32 = (u32::MAX >> SLOT_BITS) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(u32);

impl Endpoint {
    /// Wildcard source for receive
    pub const ANY: Endpoint = Endpoint(u32::MAX);
    /// No process at all
    pub const NONE: Endpoint = Endpoint(u32::MAX - 1);
    /// The calling process, resolved by senda
    pub const SELF: Endpoint = Endpoint(u32::MAX - 2);

    pub const fn new(slot: ProcNr, generation: u32) -> Self {
        Endpoint((generation << SLOT_BITS) | (slot as u32 & SLOT_MASK))
    }

    #[inline]
    pub const fn slot(self) -> ProcNr {
        (self.0 & SLOT_MASK) as ProcNr
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> SLOT_BITS
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Endpoint(raw)
    }

    pub const fn is_special(self) -> bool {
        self.0 >= Endpoint::SELF.0
    }

    /// Endpoint the slot gets when it is reused
    pub const fn next_generation(self) -> Self {
        let gen = self.generation();
        let next = if gen >= MAX_GENERATION { 0 } else { gen + 1 };
        Endpoint::new(self.slot(), next)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Endpoint::ANY => write!(f, "ANY"),
            Endpoint::NONE => write!(f, "NONE"),
            Endpoint::SELF => write!(f, "SELF"),
            ep => write!(f, "{}/{}", ep.slot(), ep.generation()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

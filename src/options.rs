//! Connection-wide configuration, threaded explicitly instead of living in module-scope
//! globals.

use crate::fcall::DEFAULT_MSIZE;
use crate::logger::Debuglevel;

/// Knobs shared by a [`crate::client::Connection`] or [`crate::server::Server`].
///
/// Earlier 9P implementations (including the one this crate's protocol behavior is
/// grounded on) kept these as package-level mutable globals; here they're an explicit
/// struct so two connections in the same process can run under different settings.
#[derive(Debug, Clone)]
pub struct Options {
    /// Msize this side proposes during version negotiation.
    pub msize: u32,
    /// Whether to negotiate `9P2000.u` rather than plain `9P2000`.
    pub dotu: bool,
    /// Akaros-compat mode: prefix every `Rerror` string with its errno as four hex
    /// digits (e.g. `"0002 file not found"`), so a legacy decoder without `.u` can
    /// still recover the numeric error.
    pub akaros: bool,
    /// Which categories of protocol trace to collect; see [`Debuglevel`].
    pub debuglevel: Debuglevel,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            msize: DEFAULT_MSIZE,
            dotu: false,
            akaros: false,
            debuglevel: Debuglevel::empty(),
        }
    }
}

impl Options {
    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn with_dotu(mut self, dotu: bool) -> Self {
        self.dotu = dotu;
        self
    }

    pub fn with_akaros(mut self, akaros: bool) -> Self {
        self.akaros = akaros;
        self
    }

    pub fn with_debuglevel(mut self, debuglevel: Debuglevel) -> Self {
        self.debuglevel = debuglevel;
        self
    }
}

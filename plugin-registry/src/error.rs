use thiserror::Error;

/// Why a descriptor handed to the registration hook was rejected.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(
        "descriptor layout mismatch: library reports {got_size}b/{got_align}b, \
         host expects {want_size}b/{want_align}b"
    )]
    AbiSkew {
        got_size: usize,
        got_align: usize,
        want_size: usize,
        want_align: usize,
    },

    #[error("descriptor carries an empty type symbol")]
    EmptySymbol,

    #[error("descriptor for `{symbol}` sets only one of factory/deleter")]
    HalfFactoryPair { symbol: String },
}

/// Why a name or alias failed to resolve to a canonical plugin name.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no plugin or alias named `{name}`")]
    NotFound { name: String },

    #[error("alias `{alias}` is ambiguous between: {}", candidates.join(", "))]
    Ambiguous {
        alias: String,
        candidates: Vec<String>,
    },
}

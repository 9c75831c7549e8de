//! Error types for the `patchwork-world` crate.
//!
//! Every variant except [`WorldError::UnknownItemType`] is a construction
//! error: it is raised once while building the item table or the scent
//! model and is never corrected silently.

/// Errors raised while building or querying the world.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// The item type list is empty.
    #[error("at least one item type must be configured")]
    EmptyItemTable,

    /// Two item types share a name.
    #[error("duplicate item type name: {name}")]
    DuplicateItemName {
        /// The repeated name.
        name: String,
    },

    /// An item's scent vector does not match the configured dimension.
    #[error("item {item}: scent has {actual} entries, expected {expected}")]
    ScentDimension {
        /// Offending item type name.
        item: String,
        /// Configured scent dimension.
        expected: usize,
        /// Length found.
        actual: usize,
    },

    /// An item's color vector does not match the configured dimension.
    #[error("item {item}: color has {actual} entries, expected {expected}")]
    ColorDimension {
        /// Offending item type name.
        item: String,
        /// Configured color dimension.
        expected: usize,
        /// Length found.
        actual: usize,
    },

    /// A per-type vector (requirements, costs, interactions) is not indexed
    /// over every item type.
    #[error("item {item}: {field} has {actual} entries, expected one per item type ({expected})")]
    NotPerType {
        /// Offending item type name.
        item: String,
        /// Field name.
        field: &'static str,
        /// Number of item types.
        expected: usize,
        /// Length found.
        actual: usize,
    },

    /// An energy function was given the wrong number of arguments.
    #[error("item {item}: {function} takes {expected} arguments, got {actual}")]
    FunctionArity {
        /// Offending item type name.
        item: String,
        /// Function family name.
        function: &'static str,
        /// Required argument count.
        expected: usize,
        /// Count supplied.
        actual: usize,
    },

    /// An energy function argument is outside its valid range.
    #[error("item {item}: invalid argument for {function}: {reason}")]
    FunctionArgument {
        /// Offending item type name.
        item: String,
        /// Function family name.
        function: &'static str,
        /// What is wrong.
        reason: &'static str,
    },

    /// A visual occlusion value is not in `[0, 1]`.
    #[error("item {item}: visual_occlusion {value} is outside [0, 1]")]
    Occlusion {
        /// Offending item type name.
        item: String,
        /// Value supplied.
        value: f32,
    },

    /// The decay and diffusion parameters make the scent model diverge.
    #[error("scent model diverges: |decay| + 4|diffusion| = {sum} >= 1")]
    DivergentScent {
        /// The offending sum.
        sum: f32,
    },

    /// The tombstone lifetime must be at least one step.
    #[error("deleted_item_lifetime must be positive")]
    ZeroLifetime,

    /// The patch size must be at least one cell.
    #[error("patch_size must be positive")]
    ZeroPatchSize,

    /// An item type index outside the table was referenced.
    #[error("unknown item type index {0}")]
    UnknownItemType(usize),
}

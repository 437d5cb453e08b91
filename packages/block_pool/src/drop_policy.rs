/// Determines what happens to chunks that are still allocated when the pool is dropped.
///
/// Block memory is always released when the pool is dropped. The policy only governs the
/// values living in chunks that callers never handed back.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use block_pool::{BlockPool, DropPolicy};
///
/// let pool = BlockPool::<u32>::builder()
///     .max_blocks(NonZero::new(4).unwrap())
///     .drop_policy(DropPolicy::MustNotHaveItems)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Values in chunks that are still allocated are abandoned: their storage is released but
    /// their destructors do not run. This is the default.
    #[default]
    AbandonItems,

    /// Values in chunks that are still allocated are dropped together with the pool.
    DropItems,

    /// The pool will panic if it still has allocated chunks when it is dropped.
    ///
    /// This may be valuable if callers hold raw pointers obtained from chunk handles and
    /// the application wants to be told loudly when such pointers would be left dangling.
    MustNotHaveItems,
}

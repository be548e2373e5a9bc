//! Procedural macros for storage-backed tests.


use proc_macro::TokenStream;

/// Attribute macro for test functions that need storage.
///
/// Creates the storage, passes it to the test body as
/// `storage: Arc<dyn Storage>`, and closes it once the body finishes.
///
/// ```ignore
/// #[opendata_macros::storage_test]
/// async fn my_test(storage: Arc<dyn Storage>) {
///     // runs against the in-memory map
/// }
///
/// #[opendata_macros::storage_test(backend = slatedb)]
/// async fn my_durable_test(storage: Arc<dyn Storage>) {
///     // runs against SlateDB on an in-memory object store
/// }
/// ```
#[proc_macro_attribute]
pub fn storage_test(args: TokenStream, input: TokenStream) -> TokenStream {
    test::storage::test_impl(args.into(), input.into()).into()
}

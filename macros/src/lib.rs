use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Runs the function body as the root coroutine of a fresh runtime.
///
/// A panic in the body is resumed on the calling thread with its original payload,
/// so the attribute composes with `#[test]` and `#[should_panic]`.
#[proc_macro_attribute]
pub fn start(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);

    let attributes = &item.attrs;
    let visibility = &item.vis;
    let signature = &item.sig;
    let body = &item.block;

    let result = quote! {
        #(#attributes)*
        #visibility #signature {
            match ::fiberkit::runtime::start(move || #body) {
                ::std::result::Result::Ok(output) => output,
                ::std::result::Result::Err(payload) => ::std::panic::resume_unwind(payload),
            }
        }
    };

    result.into()
}

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Ident, ItemStruct, LitStr, Token};

/// `#[plugin(implements(TraitA, TraitB), aliases("a", "b"))]` marks a struct
/// as a plugin class. It emits the descriptor builder (symbol, up-cast
/// functions for each listed interface, aliases, factory/deleter shims),
/// submits it to the registration collection of the enclosing module, and
/// exports the marker symbol hosts probe for statically registered classes.
///
/// The struct must implement `Default` and every listed trait; a listed
/// trait the struct does not implement is rejected at compile time by the
/// generated up-cast. Generic structs are not supported.
#[proc_macro_attribute]
pub fn plugin(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemStruct);
    let args = parse_macro_input!(attr as PluginArgs);

    if !input.generics.params.is_empty() {
        return syn::Error::new_spanned(
            &input.generics,
            "#[plugin] does not support generic plugin classes",
        )
        .to_compile_error()
        .into();
    }

    let ident = &input.ident;
    let builder_ident = format_ident!("__plugin_descriptor_{}", ident);
    let marker_ident = format_ident!("plugin_marker_{}", ident);

    let interface_decls = args.interfaces.iter().map(|path| {
        quote! {
            descriptor.declare_interface::<dyn #path>(
                |instance| instance as *const #ident as *const dyn #path,
                |instance| instance as *mut #ident as *mut dyn #path,
            );
        }
    });
    let alias_decls = args.aliases.iter().map(|alias| {
        quote! {
            descriptor.declare_alias(#alias);
        }
    });

    let expanded = quote! {
        #input

        #[doc(hidden)]
        fn #builder_ident() -> plugin_registry::PluginDescriptor {
            let mut descriptor = plugin_registry::PluginDescriptor::for_type::<#ident>();
            #(#interface_decls)*
            #(#alias_decls)*
            descriptor
        }

        inventory::submit! {
            plugin_registry::PluginRegistration::new(#builder_ident)
        }

        #[no_mangle]
        #[doc(hidden)]
        pub extern "C" fn #marker_ident() {}
    };

    TokenStream::from(expanded)
}

struct PluginArgs {
    interfaces: Vec<syn::Path>,
    aliases: Vec<LitStr>,
}

impl Parse for PluginArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut interfaces = Vec::new();
        let mut aliases = Vec::new();
        while !input.is_empty() {
            let section: Ident = input.parse()?;
            let content;
            syn::parenthesized!(content in input);
            match section.to_string().as_str() {
                "implements" => {
                    let paths = content.parse_terminated(syn::Path::parse, Token![,])?;
                    interfaces.extend(paths);
                }
                "aliases" => {
                    let names = content.parse_terminated(<LitStr as Parse>::parse, Token![,])?;
                    aliases.extend(names);
                }
                other => {
                    return Err(syn::Error::new(
                        section.span(),
                        format!("unknown #[plugin] section `{other}`, expected `implements` or `aliases`"),
                    ));
                }
            }
            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }
        Ok(PluginArgs {
            interfaces,
            aliases,
        })
    }
}

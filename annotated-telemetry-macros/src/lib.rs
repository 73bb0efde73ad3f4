// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.
// Copyright 2025 Veecle GmbH.
//
// This file has been modified from the original TiKV implementation.

//! Attribute macros weaving [`annotated_telemetry`](https://crates.io/crates/annotated-telemetry)
//! markers into functions.
//!
//! Every attribute wraps the function body so that the marker's recorder runs around each call.
//! The method identity is taken from the function's path and signature, and the binding is
//! resolved on the first call through the global dispatcher. Attributes can be stacked.

#![recursion_limit = "256"]

use std::collections::HashMap;

use proc_macro2::{Ident, Literal, Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::{Parse, ParseStream};
use syn::*;

#[derive(Clone, Copy)]
enum MarkerKind {
    Trace,
    CustomizeInnerSpan,
    Count,
    TrackConcurrency,
    Time,
    Histogram,
    Gauge,
}

impl MarkerKind {
    fn variant(self) -> Ident {
        let name = match self {
            MarkerKind::Trace => "Trace",
            MarkerKind::CustomizeInnerSpan => "CustomizeInnerSpan",
            MarkerKind::Count => "Count",
            MarkerKind::TrackConcurrency => "TrackConcurrency",
            MarkerKind::Time => "Time",
            MarkerKind::Histogram => "Histogram",
            MarkerKind::Gauge => "Gauge",
        };
        Ident::new(name, Span::call_site())
    }

    fn accepts_unit(self) -> bool {
        matches!(self, MarkerKind::Histogram | MarkerKind::Gauge)
    }

    fn accepts_component(self) -> bool {
        matches!(self, MarkerKind::Trace)
    }
}

struct Arguments {
    name: Option<LitStr>,
    tags: Vec<Tag>,
    unit: Option<LitStr>,
    component: Option<LitStr>,
    annotated_telemetry_crate: Option<syn::Path>,
}

struct Tag {
    key: LitStr,
    value: LitStr,
    span: Span,
}

impl Parse for Tag {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: LitStr = input.parse()?;
        input.parse::<Token![:]>()?;
        let value: Lit = input.parse()?;

        // For some reason, `join` fails in doc macros.
        let span = key.span().join(value.span()).unwrap_or_else(|| key.span());
        let value = match &value {
            Lit::Str(value) => value.clone(),
            Lit::Int(value) => LitStr::new(value.base10_digits(), value.span()),
            Lit::Float(value) => LitStr::new(value.base10_digits(), value.span()),
            Lit::Bool(value) => LitStr::new(&value.value.to_string(), value.span()),
            other => {
                return Err(Error::new(
                    other.span(),
                    "tag values must be string, integer, float or bool literals",
                ));
            }
        };
        Ok(Tag { key, value, span })
    }
}

impl Parse for Arguments {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name = None;
        let mut tags = Vec::<Tag>::new();
        let mut unit = None;
        let mut component = None;
        let mut annotated_telemetry_crate = None;
        let mut seen = HashMap::new();

        while !input.is_empty() {
            let ident: Ident = if input.peek(Token![crate]) {
                let token = input.parse::<Token![crate]>()?;
                Ident::new("crate", token.span)
            } else {
                input.parse()?
            };
            if seen.contains_key(&ident.to_string()) {
                return Err(Error::new(ident.span(), "duplicate argument"));
            }
            seen.insert(ident.to_string(), ());
            input.parse::<Token![=]>()?;
            match ident.to_string().as_str() {
                "name" => {
                    let parsed_name: LitStr = input.parse()?;
                    if parsed_name.value().is_empty() {
                        return Err(Error::new(parsed_name.span(), "`name` can not be empty"));
                    }
                    name = Some(parsed_name);
                }
                "tags" => {
                    let content;
                    let _brace_token = braced!(content in input);
                    let tag_list = content.parse_terminated(Tag::parse, Token![,])?;
                    for tag in tag_list {
                        if tags.iter().any(|existing| existing.key == tag.key) {
                            return Err(Error::new(tag.span, "duplicate tag key"));
                        }
                        tags.push(tag);
                    }
                }
                "unit" => {
                    unit = Some(input.parse::<LitStr>()?);
                }
                "component" => {
                    component = Some(input.parse::<LitStr>()?);
                }
                "crate" => {
                    let crate_path: syn::Path = input.parse()?;
                    annotated_telemetry_crate = Some(crate_path);
                }
                _ => return Err(Error::new(ident.span(), "unexpected identifier")),
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(Arguments {
            name,
            tags,
            unit,
            component,
            annotated_telemetry_crate,
        })
    }
}

/// Wraps every call in a span, nested under the span active in the caller.
///
/// ## Arguments
///
/// * `name` - The operation name. A template expanding `{type}`, `{simple_type}`, `{method}` and
///   `{signature}`. Defaults to the dispatcher's operation name template.
/// * `tags` - Key-value pairs set on the span, e.g. `tags = { "layer": "db" }`.
/// * `component` - Value of the span's `component` tag. Defaults to the dispatcher's component.
///
/// A call returning `Err` or panicking finishes its span with an error status.
///
/// # Examples
///
/// ```
/// #[annotated_telemetry::trace(name = "orders.{method}", component = "orders")]
/// fn load(id: u64) -> Result<String, std::io::Error> {
///     Ok(format!("order {id}"))
/// }
/// # assert!(load(7).is_ok());
/// ```
#[proc_macro_attribute]
pub fn trace(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::Trace, arguments, item)
}

/// Renames and tags the span that is active when the function is called.
///
/// Takes `name` and `tags`, as [`macro@trace`]. Does nothing when no span is active.
#[proc_macro_attribute]
pub fn customize_inner_span(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::CustomizeInnerSpan, arguments, item)
}

/// Counts calls, including ones that fail or panic.
///
/// Takes `name` and `tags`.
#[proc_macro_attribute]
pub fn count(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::Count, arguments, item)
}

/// Tracks how many calls are running at once, reported through a gauge.
///
/// Takes `name` and `tags`.
#[proc_macro_attribute]
pub fn track_concurrency(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::TrackConcurrency, arguments, item)
}

/// Records the duration of every call.
///
/// Takes `name` and `tags`.
#[proc_macro_attribute]
pub fn time(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::Time, arguments, item)
}

/// Records the returned value into a histogram.
///
/// Takes `name`, `tags` and `unit`. The function must return `i32`, `i64`, `f32` or `f64`,
/// otherwise the marker is dropped at runtime with a warning and the function runs uninstrumented.
///
/// # Examples
///
/// ```
/// #[annotated_telemetry::histogram(name = "queue.depth", unit = "items")]
/// fn depth() -> i64 {
///     3
/// }
/// # assert_eq!(depth(), 3);
/// ```
#[proc_macro_attribute]
pub fn histogram(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::Histogram, arguments, item)
}

/// Sets a gauge to the returned value.
///
/// Same arguments and return type requirement as [`macro@histogram`].
#[proc_macro_attribute]
pub fn gauge(
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(MarkerKind::Gauge, arguments, item)
}

fn expand(
    marker: MarkerKind,
    arguments: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let arguments = parse_macro_input!(arguments as Arguments);
    let input = parse_macro_input!(item as ItemFn);

    let annotated_telemetry_crate = arguments
        .annotated_telemetry_crate
        .clone()
        .map(Ok)
        .unwrap_or_else(annotated_telemetry_path);
    let annotated_telemetry_crate = match annotated_telemetry_crate {
        Ok(path) => path,
        Err(error) => return error.to_compile_error().into(),
    };

    let block = match generate_block(marker, &input, &arguments, &annotated_telemetry_crate) {
        Ok(block) => block,
        Err(error) => return error.to_compile_error().into(),
    };

    let ItemFn {
        attrs, vis, sig, ..
    } = input;

    quote!(
        #(#attrs) *
        #vis #sig
        #block
    )
    .into()
}

/// The return type as far as the recorders distinguish it.
enum Returns {
    Int,
    Long,
    Float,
    Double,
    Unit,
    Result(String),
    Other(String),
}

impl Returns {
    fn classify(output: &syn::ReturnType) -> Self {
        let ty = match output {
            syn::ReturnType::Default => return Returns::Unit,
            syn::ReturnType::Type(_, ty) => &**ty,
        };

        match ty {
            Type::Tuple(tuple) if tuple.elems.is_empty() => Returns::Unit,
            Type::Path(path) if path.qself.is_none() => {
                let path = &path.path;
                if path.is_ident("i32") {
                    Returns::Int
                } else if path.is_ident("i64") {
                    Returns::Long
                } else if path.is_ident("f32") {
                    Returns::Float
                } else if path.is_ident("f64") {
                    Returns::Double
                } else if path
                    .segments
                    .last()
                    .is_some_and(|segment| segment.ident == "Result")
                {
                    Returns::Result(type_name(ty))
                } else {
                    Returns::Other(type_name(ty))
                }
            }
            _ => Returns::Other(type_name(ty)),
        }
    }

    fn return_type(&self, krate: &syn::Path) -> TokenStream {
        match self {
            Returns::Int => quote!(#krate::ReturnType::Int),
            Returns::Long => quote!(#krate::ReturnType::Long),
            Returns::Float => quote!(#krate::ReturnType::Float),
            Returns::Double => quote!(#krate::ReturnType::Double),
            Returns::Unit => quote!(#krate::ReturnType::Unit),
            Returns::Result(name) | Returns::Other(name) => {
                quote!(#krate::ReturnType::other(#name))
            }
        }
    }

    /// Statements binding the outcome of `result`, and the expression producing it.
    fn outcome(&self, result: &Ident, krate: &syn::Path) -> (TokenStream, TokenStream) {
        if let Returns::Result(_) = self {
            // Resolves to the `Debug` classification when the error type implements it.
            let classified = Ident::new("__annotated_outcome", result.span());
            let setup = quote!(
                #[allow(unused_imports)]
                use #krate::macro_helpers::{DebugErrorOutcome as _, OpaqueErrorOutcome as _};
                let #classified = &#krate::macro_helpers::ResultOutcome::new(&#result);
            );
            return (setup, quote!(#classified.classify()));
        }
        let outcome = match self {
            Returns::Int | Returns::Long | Returns::Float | Returns::Double => quote!(
                #krate::Outcome::Returned(#krate::ReturnValue::from(#result))
            ),
            Returns::Unit => quote!(#krate::Outcome::Returned(#krate::ReturnValue::Unit)),
            Returns::Result(_) | Returns::Other(_) => {
                quote!(#krate::Outcome::Returned(#krate::ReturnValue::Opaque))
            }
        };
        (TokenStream::new(), outcome)
    }
}

/// Renders a type the way it is written, without the token spacing `quote` adds.
fn type_name(ty: &Type) -> String {
    quote!(#ty)
        .to_string()
        .replace(" :: ", "::")
        .replace(":: ", "::")
        .replace(" < ", "<")
        .replace("< ", "<")
        .replace(" >", ">")
        .replace(" ,", ",")
        .replace("& ", "&")
        .replace("( ", "(")
        .replace(" )", ")")
}

/// Whether `ty` can be written as a closure return type.
fn nameable(ty: &Type) -> bool {
    quote!(#ty).to_string().split_whitespace().all(|token| {
        token != "impl" && token != "_" && !token.starts_with('&') && !token.starts_with('\'')
    })
}

fn generate_params(
    marker: MarkerKind,
    arguments: &Arguments,
    krate: &syn::Path,
) -> syn::Result<TokenStream> {
    let mut params = quote!(#krate::MarkerParams::default());

    if let Some(name) = &arguments.name {
        params = quote!(#params.name(#name));
    }
    for Tag { key, value, span } in &arguments.tags {
        params = quote_spanned!(*span=> #params.tag(#key, #value));
    }
    if let Some(unit) = &arguments.unit {
        if !marker.accepts_unit() {
            return Err(Error::new(
                unit.span(),
                "`unit` is only supported by `histogram` and `gauge`",
            ));
        }
        params = quote!(#params.unit(#unit));
    }
    if let Some(component) = &arguments.component {
        if !marker.accepts_component() {
            return Err(Error::new(
                component.span(),
                "`component` is only supported by `trace`",
            ));
        }
        params = quote!(#params.component(#component));
    }

    Ok(params)
}

/// Generates the instrumented function body as a [`Block`] reusing the original brace tokens.
///
/// The original body runs inside an immediately called closure so that early `return`s and `?`
/// still pass through the after-hook.
fn generate_block(
    marker: MarkerKind,
    input: &ItemFn,
    arguments: &Arguments,
    krate: &syn::Path,
) -> syn::Result<Block> {
    let sig = &input.sig;
    if let Some(asyncness) = &sig.asyncness {
        return Err(Error::new(
            asyncness.span,
            "instrumentation markers are not supported on `async fn`",
        ));
    }
    if let Some(constness) = &sig.constness {
        return Err(Error::new(
            constness.span,
            "instrumentation markers are not supported on `const fn`",
        ));
    }

    let span = sig.ident.span();
    let returns = Returns::classify(&sig.output);
    let return_type = returns.return_type(krate);
    let params = generate_params(marker, arguments, krate)?;
    let variant = marker.variant();

    let parameter_types = sig
        .inputs
        .iter()
        .filter_map(|input| match input {
            FnArg::Typed(typed) => Some(type_name(&typed.ty)),
            FnArg::Receiver(_) => None,
        })
        .collect::<Vec<_>>();
    let parameter_count = Literal::usize_unsuffixed(parameter_types.len());

    let result = Ident::new("__annotated_result", span);
    let (outcome_setup, outcome) = returns.outcome(&result, krate);
    let closure_output = match &sig.output {
        syn::ReturnType::Default => quote!(-> ()),
        syn::ReturnType::Type(arrow, ty) if nameable(ty) => quote!(#arrow #ty),
        syn::ReturnType::Type(..) => quote!(),
    };
    let block = &input.block;

    let wrapper: Block = syn::parse2(quote_spanned!(span=> {
        fn __annotated_path() {}
        static __ANNOTATED_BINDING: #krate::macro_helpers::LazyBinding =
            #krate::macro_helpers::LazyBinding::new();

        let __annotated_guard = __ANNOTATED_BINDING.enter(|| {
            #krate::MethodDeclaration::new(
                #krate::macro_helpers::enclosing_method(&__annotated_path, #return_type)
                    .with_parameters::<[&str; #parameter_count], &str>([#(#parameter_types),*]),
            )
            .marker(#krate::Marker::#variant, #params)
        });

        #[allow(clippy::redundant_closure_call, clippy::unused_unit)]
        let #result = (move || #closure_output #block)();

        if let ::core::option::Option::Some(__annotated_guard) = __annotated_guard {
            #outcome_setup
            __annotated_guard.complete(#outcome);
        }
        #result
    }))?;

    Ok(Block {
        brace_token: input.block.brace_token,
        stmts: wrapper.stmts,
    })
}

/// Returns a path to the `annotated_telemetry` crate for use when macro users don't set it
/// explicitly.
fn annotated_telemetry_path() -> syn::Result<syn::Path> {
    proc_macro_crate::crate_name("annotated-telemetry")
        .map(|found| match found {
            proc_macro_crate::FoundCrate::Itself => {
                // The only place we use `annotated-telemetry` within "itself" is doc-tests, where it
                // needs to be an external path anyway.
                syn::parse_quote!(::annotated_telemetry)
            }
            proc_macro_crate::FoundCrate::Name(name) => {
                let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
                syn::parse_quote!(::#ident)
            }
        })
        .map_err(|_| {
            syn::Error::new(
                proc_macro2::Span::call_site(),
                "could not find the annotated-telemetry crate",
            )
        })
}

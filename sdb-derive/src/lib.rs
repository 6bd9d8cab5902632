use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, Type,
    TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `KernelAbi` trait.
///
/// Structs passed to the rpmsg-sdb driver through `ioctl` are read and
/// written by kernel code compiled separately from this crate. The macro
/// checks at compile time that a struct is a plain `repr(C)` aggregate of
/// fixed-width integers the kernel can copy in and out.
///
/// # Compile-Time Checks
///
/// 1. **Stable layout**: `#[repr(C)]` or `#[repr(transparent)]` is present.
/// 2. **Structs only**: enums and unions have no agreed kernel encoding.
/// 3. **No addresses or owned resources**: references, raw pointers, heap
///    and reference-counted types, process-local locks, `bool` and `char`
///    are rejected.
/// 4. **Recursive**: every field type must implement `KernelAbi`, enforced by
///    generated where clauses.
///
/// # Example
///
/// ```ignore
/// use sdb::KernelAbi;
///
/// #[derive(Clone, Copy, KernelAbi)]
/// #[repr(C)]
/// struct GetDataSize {
///     buffer_id: i32,
///     size: u32,
/// }
/// ```
#[proc_macro_derive(KernelAbi)]
pub fn derive_kernel_abi(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn sdb_path() -> proc_macro2::TokenStream {
    match crate_name("sdb") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) | Err(_) => quote!(::sdb),
    }
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    check_repr(&input.attrs, input.span())?;

    let field_types = struct_field_types(&input.data)?;
    for ty in &field_types {
        check_field(ty)?;
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let sdb = sdb_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    predicates.extend(field_types.iter().map(|ty| -> syn::WherePredicate {
        syn::parse_quote!(#ty: #sdb::__KernelAbiPrivate)
    }));

    if predicates.is_empty() {
        Ok(quote! {
            unsafe impl #impl_generics #sdb::__KernelAbiPrivate for #name #ty_generics {}
        })
    } else {
        Ok(quote! {
            unsafe impl #impl_generics #sdb::__KernelAbiPrivate for #name #ty_generics
            where
                #(#predicates),*
            {}
        })
    }
}

fn check_repr(attrs: &[Attribute], span: proc_macro2::Span) -> syn::Result<()> {
    let mut stable = false;

    for attr in attrs.iter().filter(|a| a.path().is_ident("repr")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("C") || meta.path.is_ident("transparent") {
                stable = true;
            } else if meta.input.peek(syn::token::Paren) {
                // align(N) / packed(N): skip the argument
                meta.input.parse::<proc_macro2::TokenTree>()?;
            }
            Ok(())
        })?;
    }

    if stable {
        Ok(())
    } else {
        Err(Error::new(
            span,
            "KernelAbi requires #[repr(C)] or #[repr(transparent)]\n\
             help: add #[repr(C)] so the layout matches the kernel's struct",
        ))
    }
}

fn struct_field_types(data: &Data) -> syn::Result<Vec<Type>> {
    match data {
        Data::Struct(s) => Ok(match &s.fields {
            Fields::Named(f) => f.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(f) => f.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }),
        Data::Enum(e) => Err(Error::new(
            e.enum_token.span,
            "KernelAbi cannot be derived for enums\n\
             help: carry the discriminant as a fixed-width integer field",
        )),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "KernelAbi cannot be derived for unions",
        )),
    }
}

fn check_field(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    reject_named(&segment.ident, field_ty)?;
                    if let PathArguments::AngleBracketed(args) = &segment.arguments {
                        for arg in &args.args {
                            if let GenericArgument::Type(inner) = arg {
                                walk(inner, field_ty)?;
                            }
                        }
                    }
                }
                Ok(())
            }
            Type::Reference(r) => Err(Error::new(
                r.span(),
                format!(
                    "field type `{}` contains a reference; the kernel cannot follow \
                     user-space addresses inside an ioctl payload",
                    quote!(#field_ty)
                ),
            )),
            Type::Ptr(p) => Err(Error::new(
                p.span(),
                format!(
                    "field type `{}` contains a raw pointer; pass buffers through \
                     the mapped region, not through the control payload",
                    quote!(#field_ty)
                ),
            )),
            Type::Array(a) => walk(&a.elem, field_ty),
            Type::Group(g) => walk(&g.elem, field_ty),
            Type::Paren(p) => walk(&p.elem, field_ty),
            Type::Tuple(t) => Err(Error::new(
                t.span(),
                "tuples have no guaranteed layout; use a nested #[repr(C)] struct",
            )),
            _ => Ok(()),
        }
    }

    walk(field_ty, field_ty)
}

fn reject_named(ident: &Ident, field_ty: &Type) -> syn::Result<()> {
    const OWNING: &[&str] = &[
        "Vec", "Box", "String", "PathBuf", "OsString", "CString", "Rc", "Arc",
    ];
    const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier", "OwnedFd"];
    const AMBIGUOUS: &[&str] = &["bool", "char"];

    let reason = if OWNING.iter().any(|&name| ident == name) {
        "owns process memory"
    } else if PROCESS_LOCAL.iter().any(|&name| ident == name) {
        "is a process-local resource"
    } else if AMBIGUOUS.iter().any(|&name| ident == name) {
        "has no fixed-width C counterpart"
    } else {
        return Ok(());
    };

    Err(Error::new(
        ident.span(),
        format!(
            "field type `{}` uses `{}` which {}\n\
             help: use fixed-width integers (i32, u32, u64, ...) or arrays of them",
            quote!(#field_ty),
            ident,
            reason
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn repr_ok(input: &DeriveInput) -> bool {
        check_repr(&input.attrs, input.span()).is_ok()
    }

    #[test]
    fn repr_c_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct SetEventFd { buffer_id: i32, event_fd: i32 }
        };
        assert!(repr_ok(&input));
    }

    #[test]
    fn repr_c_with_align_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C, align(8))]
            struct Aligned { value: u64 }
        };
        assert!(repr_ok(&input));
    }

    #[test]
    fn repr_transparent_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct BufferId(i32);
        };
        assert!(repr_ok(&input));
    }

    #[test]
    fn missing_repr_is_rejected() {
        let input: DeriveInput = parse_quote! {
            struct NoRepr { size: u32 }
        };
        assert!(!repr_ok(&input));
    }

    #[test]
    fn enums_and_unions_are_rejected() {
        let e: DeriveInput = parse_quote! {
            #[repr(C)]
            enum Command { SetEventFd, GetDataSize }
        };
        assert!(struct_field_types(&e.data).is_err());

        let u: DeriveInput = parse_quote! {
            #[repr(C)]
            union Raw { a: u32, b: i32 }
        };
        assert!(struct_field_types(&u.data).is_err());
    }

    #[test]
    fn struct_fields_are_collected() {
        let named: DeriveInput = parse_quote! {
            struct GetDataSize { buffer_id: i32, size: u32 }
        };
        assert_eq!(struct_field_types(&named.data).unwrap().len(), 2);

        let unit: DeriveInput = parse_quote! { struct Empty; };
        assert!(struct_field_types(&unit.data).unwrap().is_empty());
    }

    #[test]
    fn integers_and_arrays_pass() {
        let types: [Type; 4] = [
            parse_quote!(i32),
            parse_quote!(u32),
            parse_quote!(u64),
            parse_quote!([u8; 16]),
        ];
        for ty in types {
            assert!(check_field(&ty).is_ok(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn addresses_and_owned_memory_are_rejected() {
        let types: [Type; 9] = [
            parse_quote!(*const u8),
            parse_quote!(*mut u8),
            parse_quote!(&u32),
            parse_quote!(Vec<u8>),
            parse_quote!(Box<u32>),
            parse_quote!(Arc<u32>),
            parse_quote!(Option<Box<u32>>),
            parse_quote!([Mutex<u32>; 2]),
            parse_quote!(OwnedFd),
        ];
        for ty in types {
            assert!(check_field(&ty).is_err(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn bool_char_and_tuples_are_rejected() {
        let b: Type = parse_quote!(bool);
        let c: Type = parse_quote!(char);
        let t: Type = parse_quote!((i32, u32));
        assert!(check_field(&b).is_err());
        assert!(check_field(&c).is_err());
        assert!(check_field(&t).is_err());
    }
}

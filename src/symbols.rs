use cpp_demangle::{DemangleOptions, Symbol};

/// Demangle a procedure name for display. Rust symbols first, then the
/// Itanium C++ ABI; anything else passes through untouched.
pub fn demangle(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    if let Ok(symbol) = Symbol::new(name) {
        if let Ok(demangled) = symbol.demangle(&DemangleOptions::default()) {
            return demangled;
        }
    }
    name.to_string()
}

/// Strip template/generic argument lists so long names fit on one table row.
/// Everything inside `<...>` goes, however deeply nested.
pub fn abbrev(name: &str) -> String {
    let mut nesting = 0i32;
    let mut result = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '<' {
            nesting += 1;
        }
        if nesting < 1 {
            result.push(c);
        }
        if c == '>' {
            nesting -= 1;
        }
    }
    result
}

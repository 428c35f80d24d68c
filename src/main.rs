use rlox::prelude::*;

/// A tiny demonstration of the compiler: compiles a fixed source string and reports the resulting
/// chunk's size. There is no VM in this crate to actually run the bytecode — see the crate-level
/// docs.
fn main() {
    let source = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "#;

    let gc = ActiveGC::install();
    match compile(source, &gc) {
        Ok(function) => {
            println!(
                "compiled {} bytes of bytecode, {} constants",
                function.chunk.len(),
                function.chunk.constants.len(),
            );
        }
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    }
}

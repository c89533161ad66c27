//! Bulk key/value service - Main entry point
//!
//! Values never travel inside request or response messages. The client
//! registers a buffer, names it in the request, and the server moves the bytes
//! itself:
//!
//! 1. `set`: the server pulls the value out of the client's buffer and stores it
//! 2. `get`: the server pushes the stored value into the client's buffer
//! 3. The server answers with a status (`0` success, `-1` failure)
//!
//! ## Usage
//!
//! Start the server:
//! ```bash
//! cargo run --bin kv-server -- --listen-addr tcp://127.0.0.1:1234 --backend filesystem --root ./kv-data
//! ```
//!
//! Run the client:
//! ```bash
//! cargo run --bin kv-client -- set foo bar
//! cargo run --bin kv-client -- get foo --max-size 3
//! cargo run --bin kv-client -- repl
//! ```

fn main() {
    println!("Bulk KV service");
    println!();
    println!("Use the following binaries:");
    println!("  cargo run --bin kv-server -- --help");
    println!("  cargo run --bin kv-client -- --help");
    println!("  cargo run --bin kv-bench -- --help");
}

//! Compiler and virtual machine for a CON-style game behaviour scripting
//! language: scripts compile to a flat bytecode `Program` that a small
//! interpreter runs per event and per actor against an object store.

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;

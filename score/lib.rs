#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod batch;
pub mod evaluate;
pub mod io;
pub mod kernel;
pub mod output;
pub mod pipeline;
pub mod prepare;
pub mod types;
pub mod weights;

mod common;

mod enrollment;

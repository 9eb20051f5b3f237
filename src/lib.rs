pub mod proto {
    pub mod tensorboard {
        include!("tensorboard.pb.rs");
    }
}

pub mod convert;
pub mod event;
pub mod event_file;
pub mod file_writer;
pub mod graph;
pub mod masked_crc;
pub mod program;
pub mod reader;
pub mod summary;
pub mod tf_record;
pub mod writer;

pub use convert::convert;
pub use file_writer::{run_dir, FileWriter};

#[cfg(test)]
mod scripted_reader;

pub mod geothunk;

pub mod dbfiles;

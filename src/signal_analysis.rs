pub mod classification;
pub mod hmm;

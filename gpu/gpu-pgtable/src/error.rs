use gpu_addresses::VaRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PtError {
    #[error("out of memory allocating a level {level} table")]
    OutOfMemory { level: u32 },
    #[error("range {0} is not 4 KiB aligned")]
    Unaligned(VaRange),
    #[error("range {0} lies outside the translated address space")]
    OutOfRange(VaRange),
    #[error("prepared update does not match the current tree")]
    Stale,
}

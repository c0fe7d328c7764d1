use std::fs::File;
use std::ops::Deref;

pub fn read_trace(file: File) -> Result<impl Deref<Target = [u8]>, String> {
    // Compatibility on other systems
    #[cfg(not(unix))]
    {
        use std::io::Read;
        let mut buffer = Vec::new();
        let mut file = file;
        file.read_to_end(&mut buffer)
            .map_err(|e| format!("Couldn't read the trace file: {e}"))?;
        Ok(buffer)
    }
    // Memory map the file for speed on unix systems
    #[cfg(unix)]
    {
        use memmap2::{Advice, Mmap};
        unsafe {
            let m = Mmap::map(&file).map_err(|e| format!("Couldn't memory map the file: {e}"))?;
            m.advise(Advice::Sequential)
                .map_err(|e| format!("Failed to provide access advice to the OS, {e}"))?;
            Ok(m)
        }
    }
}

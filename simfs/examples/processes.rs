use std::sync::Arc;
use std::thread;

use simfs::FileSystem;

const MAX_OPEN_FILES: u32 = 4;
const MAX_PROCESSES: u32 = 3;

/// Each simulated process creates its own file, writes to it, reads it back,
/// then peeks at a neighbour's file before cleaning up.
fn run_process(fs: Arc<FileSystem>, pid: u32) {
    let name = format!("file{}", pid);
    let neighbour = format!("file{}", pid % MAX_PROCESSES + 1);

    let created = fs.create_file(&name, 100 * pid as usize, pid);
    println!("[{}] create {}: {:?}", pid, name, created);

    let greeting = format!("hello from process {}", pid);
    let written = fs.write_file(&name, pid, greeting.as_bytes());
    println!("[{}] write {}: {:?}", pid, name, written);
    match fs.read_file(&name, pid) {
        Ok(data) => println!("[{}] read {}: {}", pid, name, String::from_utf8_lossy(&data)),
        Err(e) => println!("[{}] read {}: {}", pid, name, e),
    }

    match fs.open_file(&neighbour, pid) {
        Ok(handle) => {
            println!("[{}] opened {} as handle {}", pid, neighbour, handle);
            let closed = fs.close_file(&neighbour, pid);
            println!("[{}] close {}: {:?}", pid, neighbour, closed);
        }
        Err(e) => println!("[{}] open {}: {}", pid, neighbour, e),
    }

    let closed = fs.close_file(&name, pid);
    println!("[{}] close {}: {:?}", pid, name, closed);
}

pub fn main() {
    let fs = Arc::new(FileSystem::new(MAX_OPEN_FILES, MAX_PROCESSES));

    let processes: Vec<_> = (1..=MAX_PROCESSES)
        .map(|pid| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || run_process(fs, pid))
        })
        .collect();
    for process in processes {
        process.join().expect("process thread panicked");
    }

    println!("Directory entries:");
    for file in fs.list_files() {
        println!(
            "  {} start block {} ({} blocks, {} bytes)",
            file.name, file.start_block, file.size_in_blocks, file.size_in_bytes
        );
    }

    // Every file is closed again, so any process may delete it.
    println!("delete file1: {:?}", fs.delete_file("file1", 2));
    print!("{}", fs.dump());
}

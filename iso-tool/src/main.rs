use binrw::BinWriterExt;
use clap::Parser;
use std::{
    fs::{create_dir_all, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use wiiso::{builder::CopyBuilder, builder::WiiDiscBuilder, structs::WiiPartType, WiiIsoReader};

#[derive(Debug, Parser)]
#[clap(about = "Utility to inspect and rebuild wii isos")]
enum Commands {
    #[clap(about = "show the partitions of the iso")]
    Sections { filename: PathBuf },
    #[clap(about = "print all file names present in the given section")]
    PrintFiles {
        filename: PathBuf,
        #[clap(long, default_value = "DATA")]
        section: String,
    },
    #[clap(about = "extract the system files of an iso partition to a destination folder")]
    ExtractSys {
        filename: PathBuf,
        destination: PathBuf,
        #[clap(long, default_value = "DATA")]
        section: String,
    },
    #[clap(about = "rebuild an ISO, copying the DATA partition")]
    Copy {
        src_file: PathBuf,
        dest_file: PathBuf,
    },
}

#[derive(Error, Debug)]
enum MyError {
    #[error("IO Error: {io_error}")]
    IOError {
        #[from]
        io_error: std::io::Error,
    },
    #[error("Read error: {error}")]
    BinrwError {
        #[from]
        error: binrw::error::Error,
    },
    #[error("{0} is not a valid section, options are: DATA, CHANNEL, UPDATE")]
    InvalidSection(String),
    #[error("section {0:?} not present!")]
    SectionNotFound(WiiPartType),
    #[error("{0}")]
    StringError(String),
}

impl From<String> for MyError {
    fn from(s: String) -> Self {
        MyError::StringError(s)
    }
}

fn parse_section(section: &str) -> Result<WiiPartType, MyError> {
    match section.to_ascii_uppercase().as_str() {
        "DATA" => Ok(WiiPartType::Data),
        "UPDATE" => Ok(WiiPartType::Update),
        "CHANNEL" => Ok(WiiPartType::Channel),
        _ => Err(MyError::InvalidSection(section.to_owned())),
    }
}

fn write_file(folder: &Path, filename: &str, data: &[u8]) -> std::io::Result<()> {
    let mut f = File::create(folder.join(filename))?;
    f.write_all(data)?;
    f.flush()?;
    Ok(())
}

fn main() -> Result<(), MyError> {
    let args = Commands::parse();
    match args {
        Commands::Sections { filename } => {
            let f = File::open(filename)?;
            let reader = WiiIsoReader::create(f)?;
            for partition in reader.partitions() {
                println!("{:?}: {:X}", partition.part_type, *partition.part_data_off);
            }
        }
        Commands::PrintFiles { section, filename } => {
            let f = File::open(filename)?;
            let mut reader = WiiIsoReader::create(f)?;
            let part_type = parse_section(&section)?;
            let entry = reader
                .find_partition(part_type)
                .ok_or(MyError::SectionNotFound(part_type))?;
            let partition = reader.open_partition(&entry)?;
            partition.fst().print_tree();
        }
        Commands::ExtractSys {
            section,
            destination,
            filename,
        } => {
            let f = File::open(filename)?;
            let mut reader = WiiIsoReader::create(f)?;
            let part_type = parse_section(&section)?;
            let entry = reader
                .find_partition(part_type)
                .ok_or(MyError::SectionNotFound(part_type))?;
            let mut partition = reader.open_partition(&entry)?;

            let sys_folder = destination.join("sys");
            create_dir_all(&sys_folder)?;
            let mut boot = File::create(sys_folder.join("boot.bin"))?;
            boot.write_be(partition.get_internal_header())?;
            boot.flush()?;
            let bi2 = partition.read_bi2()?;
            write_file(&sys_folder, "bi2.bin", &bi2)?;
            let apploader = partition.read_apploader()?;
            write_file(&sys_folder, "apploader.img", &apploader)?;
            let dol = partition.read_dol()?;
            write_file(&sys_folder, "main.dol", &dol)?;
            let fst_off = *partition.get_internal_header().fst_off;
            let fst_size = *partition.get_internal_header().fst_sz;
            let fst_buf = partition.crypto().read_at(fst_off, fst_size as usize)?;
            write_file(&sys_folder, "fst.bin", &fst_buf)?;
        }
        Commands::Copy {
            src_file,
            dest_file,
        } => {
            let f = File::open(src_file)?;
            let mut reader = WiiIsoReader::create(f)?;
            let entry = reader
                .find_partition(WiiPartType::Data)
                .ok_or(MyError::SectionNotFound(WiiPartType::Data))?;
            let disc_header = reader.get_header().clone();
            let region = *reader.get_region();

            let partition = reader.open_partition(&entry)?;
            let mut copy_builder =
                CopyBuilder::new(partition).map_err(|e| format!("{e:?}"))?;

            let dest = OpenOptions::new()
                .truncate(true)
                .create(true)
                .read(true)
                .write(true)
                .open(dest_file)?;
            let mut builder = WiiDiscBuilder::create(dest, disc_header, region);
            let mut last_percent = 0u8;
            let file_count = builder
                .add_partition(&mut copy_builder, &mut |percent| {
                    if percent != last_percent {
                        last_percent = percent;
                        print!("\rcopying: {percent:3}%");
                        let _ = std::io::stdout().flush();
                    }
                })
                .map_err(|e| format!("{e:?}"))?;
            builder.finish()?;
            println!("\rcopied {file_count} files");
        }
    }
    Ok(())
}

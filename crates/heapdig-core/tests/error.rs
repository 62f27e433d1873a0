//! Tests for error handling

use heapdig_core::error::{HeapdigError, Result};
use heapdig_core::types::Address;

#[test]
fn test_out_of_bounds_display()
{
    let error = HeapdigError::OutOfBounds {
        address: Address::new(0x1000),
        length: 16,
    };
    let message = error.to_string();
    assert!(message.contains("16 bytes"));
    assert!(message.contains("0x0000000000001000"));
}

#[test]
fn test_unknown_concrete_type_display()
{
    let error = HeapdigError::UnknownConcreteType {
        descriptor: Address::new(0x4c_2000),
    };
    assert!(error.to_string().contains("0x00000000004c2000"));
}

#[test]
fn test_malformed_input_display()
{
    let error = HeapdigError::MalformedContainer("not a core file".to_string());
    assert!(error.to_string().contains("not a core file"));

    let error = HeapdigError::MalformedMetadata("no .debug_info".to_string());
    assert!(error.to_string().contains("Malformed metadata"));
}

#[test]
fn test_io_error_converts()
{
    fn open() -> Result<()>
    {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "core.1"))?;
        Ok(())
    }
    assert!(matches!(open(), Err(HeapdigError::Io(_))));
}

#[test]
fn test_result_type()
{
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(HeapdigError::InvalidArgument("bad regex".to_string()));
}

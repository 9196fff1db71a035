pub mod clint;
pub mod plic;
pub mod uart;
pub mod virtio_blk;

pub use clint::{Clint, CLINT_BASE, CLINT_SIZE};
pub use plic::{Plic, PLIC_BASE, PLIC_SIZE};
pub use uart::{Uart, UART0_BASE, UART0_IRQ, UART_SIZE};
pub use virtio_blk::{VirtioBlock, VIRT0_BASE, VIRT0_IRQ, VIRT_SIZE};
